use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

const STUB_CONFIG: &str = r#"
database = "state/tags.db"
progress_interval_secs = 60

[tagger]
program = "sh"
args = ["-c", '''
while IFS= read -r file; do
  name=$(basename "$file" .c)
  printf '%s\t%s\t/^int %s(void)$/;"\tfunction\tline:1\tlanguage:C\n' "$name" "$file" "$name"
done
''']
"#;

#[allow(deprecated)]
fn tagdex(workdir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tagdex").expect("binary");
    cmd.current_dir(workdir).env_remove("TAGDEX_DB").arg("--quiet");
    cmd
}

fn json_output(workdir: &Path, args: &[&str]) -> Value {
    let output = tagdex(workdir).args(args).output().expect("command run");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid json")
}

fn setup_project() -> TempDir {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    fs::write(root.join("tagdex.toml"), STUB_CONFIG).expect("write config");
    fs::create_dir_all(root.join("src")).expect("create src");
    fs::write(
        root.join("src/parser.c"),
        "int parser(void) {\n    return parse_header();\n}\n",
    )
    .expect("write parser.c");
    fs::write(root.join("src/main.c"), "int main(void) {\n    return parser();\n}\n")
        .expect("write main.c");
    fs::write(root.join("src/README.md"), "parse_header docs\n").expect("write readme");
    temp
}

#[test]
fn folders_and_filters_round_trip() {
    let temp = setup_project();
    let root = temp.path();

    tagdex(root).args(["folder", "add", "src"]).assert().success();
    tagdex(root)
        .args(["filter", "add", "*.c", "--language", "C"])
        .assert()
        .success();

    let folders = json_output(root, &["folder", "list", "--json"]);
    let listed = folders[0]["path"].as_str().expect("folder path");
    assert!(listed.ends_with("src"), "{listed}");

    let filters = json_output(root, &["filter", "list", "--json"]);
    assert_eq!(filters[0]["pattern"], "*.c");
    assert_eq!(filters[0]["language"], "C");

    tagdex(root)
        .args(["filter", "remove", "*.c"])
        .assert()
        .success();
    tagdex(root)
        .args(["filter", "remove", "*.c"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No filter"));
}

#[test]
fn invalid_filter_pattern_is_rejected() {
    let temp = setup_project();
    tagdex(temp.path())
        .args(["filter", "add", "[oops"])
        .assert()
        .failure();
}

#[test]
fn preferences_persist_between_invocations() {
    let temp = setup_project();
    let root = temp.path();

    tagdex(root)
        .args(["pref", "set", "search.mode", "content"])
        .assert()
        .success();
    tagdex(root)
        .args(["pref", "get", "search.mode"])
        .assert()
        .success()
        .stdout("content\n");
    tagdex(root)
        .args(["pref", "get", "missing"])
        .assert()
        .failure();
}

#[cfg(unix)]
#[test]
fn index_then_search_every_mode() {
    let temp = setup_project();
    let root = temp.path();

    tagdex(root).args(["folder", "add", "src"]).assert().success();
    tagdex(root).args(["filter", "add", "*.c"]).assert().success();

    let stats = json_output(root, &["index", "--json"]);
    assert_eq!(stats["files_changed"], 2);
    assert_eq!(stats["tags_added"], 2);

    let again = json_output(root, &["index", "--json"]);
    assert_eq!(again["files_changed"], 0);

    let tags = json_output(root, &["search", "tags", "pars", "--json"]);
    assert_eq!(tags["status"], "completed");
    assert_eq!(tags["hits"][0]["name"], "parser");
    assert_eq!(tags["hits"][0]["line"], 1);

    let files = json_output(root, &["search", "files", "main.c", "--json"]);
    let hits = files["hits"].as_array().expect("hits");
    assert_eq!(hits.len(), 1);
    assert!(hits[0]["path"].as_str().expect("path").ends_with("main.c"));

    // README.md is not matched by any filter, so its text is not indexed.
    tagdex(root)
        .args(["search", "content", r"parse_\w+"])
        .assert()
        .success()
        .stdout(predicate::str::contains("parser.c:2:     return parse_header();"))
        .stdout(predicate::str::contains("README").not());

    let stats = json_output(root, &["stats", "--json"]);
    assert_eq!(stats["source_files"], 2);
    assert_eq!(stats["tags"], 2);

    tagdex(root).arg("clear").assert().success();
    let stats = json_output(root, &["stats", "--json"]);
    assert_eq!(stats["tags"], 0);
    tagdex(root).arg("compact").assert().success();
}

#[test]
fn invalid_content_pattern_fails_with_a_message() {
    let temp = setup_project();
    tagdex(temp.path())
        .args(["search", "content", "main("])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid content query"));

    let report = json_output(temp.path(), &["search", "content", "main(", "--json"]);
    assert_eq!(report["status"], "invalid_input");
    assert!(report["hits"].as_array().expect("hits").is_empty());
}

#[test]
fn unknown_config_keys_are_reported() {
    let temp = setup_project();
    fs::write(temp.path().join("broken.toml"), "queue_capcity = 3\n").expect("write config");
    tagdex(temp.path())
        .args(["--config", "broken.toml", "stats"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("broken.toml"));
}
