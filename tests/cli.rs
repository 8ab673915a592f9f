use std::process::Command;

fn daq_sync() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_daq-sync"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn finite_run_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("data.txt");

    let out = daq_sync()
        .args(["--finite", "-n", "100", "-o"])
        .arg(&output)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&out.stderr);

    assert!(out.status.success(), "{}", stderr);
    assert_eq!(stderr.matches("End of program").count(), 1);
    assert!(!stderr.contains("Error"));
    assert!(output.exists());
}

#[test]
fn unwritable_output_reports_error_once() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("missing").join("data.txt");

    let out = daq_sync().arg("-o").arg(&output).output().unwrap();
    let stderr = String::from_utf8_lossy(&out.stderr);

    assert_eq!(out.status.code(), Some(1));
    assert_eq!(stderr.matches("Error").count(), 1, "{}", stderr);
}
