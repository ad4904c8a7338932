//! End-to-end tests of the limar binary
//!
//! Each test writes a manifest into a temp directory, points the process at
//! it through the environment, and drives the real CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct TestEnv {
    _temp_dir: TempDir,
    manifest_path: std::path::PathBuf,
    cache_root: std::path::PathBuf,
    shell_script: std::path::PathBuf,
}

impl TestEnv {
    fn new(manifest: &str) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let manifest_path = temp_dir.path().join("manifest.limar");
        std::fs::write(&manifest_path, manifest).expect("write manifest");

        Self {
            manifest_path,
            cache_root: temp_dir.path().join("cache"),
            shell_script: temp_dir.path().join("source"),
            _temp_dir: temp_dir,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("limar").expect("limar binary");
        cmd.env("LIMAR_MANIFEST_PATH", &self.manifest_path)
            .env("LIMAR_CACHE_ROOT", &self.cache_root)
            // Global options take `--opt=value` form: the global section of
            // the command line ends at the first non-option token
            .arg(format!("--shell-script={}", self.shell_script.display()));
        cmd
    }
}

#[test]
fn test_item_set_resolution() {
    let env = TestEnv::new("a (x, y)\nb (y)\ns = x & y\ns2 = x | y\n");

    env.command()
        .args(["manifest", "item-set", "^s2$"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ref: a"))
        .stdout(predicate::str::contains("ref: b"));

    env.command()
        .args(["manifest", "item-set", "^s$"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ref: a"))
        .stdout(predicate::str::contains("ref: b").not());
}

#[test]
fn test_item_resolution_with_properties() {
    let env = TestEnv::new("dir/proj-one (project)\ndir/proj-two (project)\n");

    env.command()
        .args(["manifest", "item", "one", "--property", "ref"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ref: dir/proj-one"))
        .stdout(predicate::str::contains("tags").not());
}

#[test]
fn test_unknown_item_fails_with_nonzero_exit() {
    let env = TestEnv::new("a (x)\n");

    env.command()
        .args(["manifest", "item", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Item not found"));
}

const QUERY_MANIFEST: &str = "\
greeting (interesting)
@subject {
  item (id: ref)
}
@cache (disabled) {
  @subjects (item) {
    @query (command: \"- manifest.get_item(greeting) : .\", parse: .[0]) {
      item-info
    }
  }
}
";

#[test]
fn test_query_runs_and_renders_entities() {
    let env = TestEnv::new(QUERY_MANIFEST);

    env.command()
        .args(["command", "item"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ref"))
        .stdout(predicate::str::contains("greeting"));
}

#[test]
fn test_forwarding_through_tabulate_and_render() {
    let env = TestEnv::new(QUERY_MANIFEST);

    let direct = env
        .command()
        .args(["command", "item"])
        .assert()
        .success();
    let direct_output = String::from_utf8_lossy(&direct.get_output().stdout).to_string();

    // The same pipeline spelled out with explicit forwarding
    let piped = env
        .command()
        .args(["command", "item", "->", "tabulate", "->", "render"])
        .assert()
        .success();
    let piped_output = String::from_utf8_lossy(&piped.get_output().stdout).to_string();

    assert_eq!(direct_output, piped_output);
    assert!(piped_output.contains("greeting"));
}

#[test]
fn test_show_alias_rejects_actions() {
    let manifest = "\
@cache (disabled) {
  @action (command: \"true\") {
    do-thing
  }
}
";
    let env = TestEnv::new(manifest);

    env.command()
        .args(["show", "-c", "do-thing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not allowed"));

    env.command()
        .args(["run", "-c", "do-thing", "-U", "RUN"])
        .assert()
        .success();
}

const CACHED_MANIFEST: &str = "\
@cache (enabled, retention: session) {
  @query (command: \"date +%s%N\", parse: .[0]) {
    q
  }
}
";

#[test]
fn test_query_cache_round_trip() {
    let env = TestEnv::new(CACHED_MANIFEST);

    let first = env
        .command()
        .args(["command", "-c", "q", "-U", "RUN"])
        .assert()
        .success();
    let first_output = String::from_utf8_lossy(&first.get_output().stdout).to_string();

    // Cached: the second invocation must not re-run `date`
    let second = env
        .command()
        .args(["command", "-c", "q", "-U", "RUN"])
        .assert()
        .success();
    let second_output = String::from_utf8_lossy(&second.get_output().stdout).to_string();
    assert_eq!(first_output, second_output);

    // Deleting the entry forces a re-run
    env.command()
        .args(["cache", "delete", "^query\\.q"])
        .assert()
        .success();

    let third = env
        .command()
        .args(["command", "-c", "q", "-U", "RUN"])
        .assert()
        .success();
    let third_output = String::from_utf8_lossy(&third.get_output().stdout).to_string();
    assert_ne!(first_output, third_output);
}

#[test]
fn test_failing_command_fails_run() {
    let manifest = "\
@cache (disabled) {
  @query (command: \"false\", parse: .) {
    broken
  }
}
";
    let env = TestEnv::new(manifest);

    env.command()
        .args(["command", "-c", "broken"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("return code"));
}

#[test]
fn test_allowed_to_fail_marker() {
    let manifest = "\
@cache (disabled) {
  @query (command: \"! false && echo ok\", parse: .[1]) {
    tolerant
  }
}
";
    let env = TestEnv::new(manifest);

    env.command()
        .args(["command", "-c", "tolerant", "-U", "RUN"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn test_bad_manifest_reports_parse_error() {
    let env = TestEnv::new("a (x\n");

    env.command()
        .args(["manifest", "item", "a"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Manifest error"));
}
