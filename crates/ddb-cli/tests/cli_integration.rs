use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

struct CliFixture {
    _tmp: TempDir,
    config: String,
    root: PathBuf,
}

impl CliFixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let config_path = root.join("ddb.yaml");
        write_config(&config_path);
        Self {
            config: config_path.to_string_lossy().to_string(),
            root,
            _tmp: tmp,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(ddbctl_binary_path());
        cmd.arg("--config").arg(&self.config);
        cmd.args(args);
        cmd.env("NO_COLOR", "1");
        cmd.env_remove("DDB_CONFIG");
        cmd.output().unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "command failed: {:?}\nstdout:\n{}\nstderr:\n{}",
                args,
                stdout(&output),
                stderr(&output)
            );
        }
        stdout(&output)
    }

    fn run_err(&self, args: &[&str]) -> (String, String) {
        let output = self.run(args);
        assert!(
            !output.status.success(),
            "command unexpectedly succeeded: {:?}\nstdout:\n{}\nstderr:\n{}",
            args,
            stdout(&output),
            stderr(&output)
        );
        (stdout(&output), stderr(&output))
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn ddbctl_binary_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_ddbctl") {
        return PathBuf::from(path);
    }

    let current_exe = std::env::current_exe().expect("failed to resolve current test binary path");
    let debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .expect("unexpected test binary path layout");
    let candidate = debug_dir.join("ddbctl");
    assert!(
        candidate.exists(),
        "unable to locate ddbctl binary at {:?}",
        candidate
    );
    candidate
}

fn write_config(config_path: &Path) {
    let config = "\
paths:
  index_root: index
  backup_dir: backups
recon:
  helper_timeout: 10s
  resume_delay: 10ms
quiesce:
  drain_timeout: 2s
";
    std::fs::write(config_path, config).unwrap();
}

#[test]
fn create_backup_and_status_roundtrip() {
    let fx = CliFixture::new();
    let out = fx.run_ok(&["create-store", "primary", "--partitions", "2"]);
    assert!(out.contains("Created store#1 'primary' with 2 substore(s)"));

    let out = fx.run_ok(&["backup", "-S", "primary", "--size", "1M", "--substore", "1"]);
    assert!(out.contains("wrote volume#1"), "{out}");
    assert!(out.contains("16 chunks"), "{out}");

    let status = fx.run_ok(&["status"]);
    assert!(status.contains("primary"));
    assert!(status.contains("1.00 MiB"));

    let detail = fx.run_ok(&["status", "-S", "primary"]);
    assert!(detail.contains("1 active, 0 pending prune, 0 aged"), "{detail}");
    assert!(fx.root.join("index").join("ledger.mpk").exists());
}

#[test]
fn duplicate_store_and_unknown_store_are_errors() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary"]);
    let (_, err) = fx.run_err(&["create-store", "primary"]);
    assert!(err.contains("already exists"), "{err}");

    let (_, err) = fx.run_err(&["backup", "-S", "missing", "--size", "10K"]);
    assert!(err.contains("store 'missing'"), "{err}");

    let (_, err) = fx.run_err(&["backup", "-S", "primary", "--size", "10K", "--substore", "3"]);
    assert!(err.contains("out of range"), "{err}");
}

#[test]
fn ddb_backup_recon_and_resync() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary"]);
    fx.run_ok(&["backup", "-S", "primary", "--size", "64K"]);

    let out = fx.run_ok(&["ddb-backup", "-S", "primary"]);
    assert!(out.contains("DDB backup job#2 of 'primary' complete: 1 substore(s)"), "{out}");
    assert!(fx.root.join("backups").join("job-2").exists());

    fx.run_ok(&["backup", "-S", "primary", "--size", "64K"]);
    let out = fx.run_ok(&["recon", "-S", "primary"]);
    assert!(out.contains("Regular reconstruction"), "{out}");
    assert!(out.contains("completed: 1/1 volumes recovered"), "{out}");

    let detail = fx.run_ok(&["status", "-S", "primary"]);
    assert!(detail.contains("needed"), "{detail}");

    let out = fx.run_ok(&["resync", "-S", "primary"]);
    assert!(out.contains("attempt 1"), "{out}");
}

#[test]
fn full_recon_then_dv2() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary", "-p", "2"]);
    fx.run_ok(&["backup", "-S", "primary", "--size", "128K"]);
    fx.run_ok(&["backup", "-S", "primary", "--size", "128K", "--substore", "1"]);

    let out = fx.run_ok(&["recon", "-S", "primary", "--full"]);
    assert!(out.contains("Full reconstruction"), "{out}");
    assert!(out.contains("2/2 volumes recovered"), "{out}");

    let out = fx.run_ok(&["dv2", "-S", "primary", "--speed", "thorough"]);
    assert!(out.contains("2 volume(s) checked"), "{out}");
    assert!(out.contains("No problems found"), "{out}");

    let out = fx.run_ok(&["dv2", "-S", "primary", "--mode", "incremental"]);
    assert!(out.contains("0 volume(s) checked, 2 skipped"), "{out}");
}

#[test]
fn worm_lock_refuses_reclaim() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary"]);
    let out = fx.run_ok(&["worm", "-S", "primary", "--days", "5"]);
    assert!(out.contains("WORM lock on 'primary' until"), "{out}");

    let (_, err) = fx.run_err(&["reclaim", "-S", "primary", "--orphans"]);
    assert!(err.contains("WORM-locked"), "{err}");

    let (_, err) = fx.run_err(&["worm", "-S", "primary", "--days", "0"]);
    assert!(err.contains("days"), "{err}");
}

#[test]
fn reclaim_removes_orphans() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary"]);
    fx.run_ok(&["backup", "-S", "primary", "--size", "4K"]);
    let stray = fx
        .root
        .join("index")
        .join("store-1")
        .join("substore-1")
        .join("stray.bin");
    std::fs::write(&stray, b"x").unwrap();

    let out = fx.run_ok(&["reclaim", "-S", "primary", "--orphans"]);
    assert!(out.contains("1 orphan file(s) removed"), "{out}");
    assert!(!stray.exists());
}

#[test]
fn delete_job_and_prune() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary"]);
    fx.run_ok(&["backup", "-S", "primary", "--size", "8K"]);

    let list = fx.run_ok(&["prune", "--list", "primary"]);
    assert!(list.contains("keep"), "{list}");
    assert!(list.contains("job#1"), "{list}");

    let out = fx.run_ok(&["delete-job", "1"]);
    assert!(out.contains("Deleted job#1"), "{out}");
    let out = fx.run_ok(&["prune"]);
    assert!(out.contains("1 volume(s) marked, 1 aged, 0 purged"), "{out}");

    let out = fx.run_ok(&["maintain", "--once"]);
    assert!(out.contains("1 purged"), "{out}");

    let (_, err) = fx.run_err(&["delete-job", "99"]);
    assert!(err.contains("job#99"), "{err}");
}

#[test]
fn seal_blocks_new_backups() {
    let fx = CliFixture::new();
    fx.run_ok(&["create-store", "primary"]);
    // A store must live for a day before it can be sealed.
    let (_, err) = fx.run_err(&["seal", "-S", "primary"]);
    assert!(err.contains("sealing requires"), "{err}");
}

#[test]
fn missing_config_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let output = Command::new(ddbctl_binary_path())
        .args(["--config"])
        .arg(tmp.path().join("absent.yaml"))
        .arg("status")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot read config"));
}
