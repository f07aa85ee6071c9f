// Multi-process session lock smoke tests through the CLI.
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;

fn cmd(dir: &Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_lapis");
    let mut command = Command::new(exe);
    command.arg("--dir").arg(dir).env_remove("RUST_LOG");
    command
}

fn read_counter(dir: &Path) -> Value {
    let output = cmd(dir)
        .args(["read", "counters", "shared"])
        .output()
        .expect("read");
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).expect("json");
    value["data"]["n"].clone()
}

fn is_locked(dir: &Path) -> bool {
    let output = cmd(dir)
        .args(["info", "counters", "shared"])
        .output()
        .expect("info");
    let value: Value = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
    value["locked"] == Value::Bool(true)
}

#[test]
fn concurrent_bumps_are_serialized() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let workers = 8;
    let mut children = Vec::new();
    for _ in 0..workers {
        let child = cmd(&dir)
            .args([
                "--load-attempts",
                "1000",
                "--load-retry-delay-ms",
                "10",
                "bump",
                "counters",
                "shared",
                "n",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        children.push(child);
    }

    for mut child in children {
        let status = child.wait().expect("wait");
        assert!(status.success());
    }

    assert_eq!(read_counter(&dir), Value::from(workers));
    assert!(!is_locked(&dir));
}

#[test]
fn held_lock_blocks_other_processes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("stores");

    let mut holder = cmd(&dir)
        .args(["bump", "counters", "shared", "n", "--hold-ms", "3000"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn holder");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !is_locked(&dir) {
        assert!(Instant::now() < deadline, "holder never took the lock");
        std::thread::sleep(Duration::from_millis(20));
    }

    let blocked = cmd(&dir)
        .args([
            "--load-attempts",
            "2",
            "--load-retry-delay-ms",
            "10",
            "bump",
            "counters",
            "shared",
            "n",
        ])
        .output()
        .expect("blocked bump");
    assert_eq!(blocked.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&blocked.stderr);
    let err: Value = serde_json::from_str(stderr.lines().last().expect("line")).expect("json");
    assert_eq!(err["error"]["kind"], "LockUnavailable");
    assert_eq!(err["error"]["attempts"], 2);

    assert!(holder.wait().expect("wait").success());
    assert_eq!(read_counter(&dir), Value::from(1));
    assert!(!is_locked(&dir));
}
