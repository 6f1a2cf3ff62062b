//! Binary-level tests for argument handling

use assert_cmd::Command;
use predicates::prelude::*;

fn downly(home: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("downly").unwrap();
    cmd.current_dir(home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env("HOME", home.path());
    cmd
}

#[test]
fn test_help_lists_commands() {
    let home = tempfile::tempdir().unwrap();
    downly(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("formats"))
        .stdout(predicate::str::contains("sweep"));
}

#[test]
fn test_fetch_rejects_conflicting_selectors() {
    let home = tempfile::tempdir().unwrap();
    downly(&home)
        .args(["fetch", "https://youtu.be/abc", "--audio", "--format", "22"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_formats_rejects_invalid_url() {
    let home = tempfile::tempdir().unwrap();
    downly(&home)
        .args(["formats", "ftp://example.com/file.mp4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid URL"));
}

#[test]
fn test_config_show_prints_defaults() {
    let home = tempfile::tempdir().unwrap();
    downly(&home)
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Concurrent Jobs: 3"))
        .stdout(predicate::str::contains("mp3 @ 192kbps"));
}
