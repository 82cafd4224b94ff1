//! CLI-level tests that run the real binary against a temp base directory.
//! Anything needing a live hypervisor stays in the unit tests, which stub
//! the virsh surface.

use assert_cmd::Command;
use predicates::prelude::*;

fn dockvirt(home: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dockvirt").unwrap();
    cmd.env("DOCKVIRT_HOME", home.path());
    cmd
}

fn write_project(dir: &tempfile::TempDir, extra: &str) {
    std::fs::write(
        dir.path().join(".dockvirt"),
        format!("name=demo\ndomain=demo.local\nimage=nginx:latest\nport=80\n{extra}"),
    )
    .unwrap();
}

#[test]
fn help_works() {
    let home = tempfile::tempdir().unwrap();
    dockvirt(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("reverse proxy"));
}

#[test]
fn unknown_os_exits_2_without_creating_work_dir() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write_project(&project, "os=alpine99\n");

    dockvirt(&home)
        .current_dir(project.path())
        .arg("up")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("alpine99"));

    assert!(
        !home.path().join("demo").exists(),
        "no work dir may be created for a rejected spec"
    );
}

#[test]
fn mem_below_minimum_exits_2() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write_project(&project, "mem=255\n");

    dockvirt(&home)
        .current_dir(project.path())
        .arg("up")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("255"));
}

#[test]
fn missing_project_config_exits_2() {
    let home = tempfile::tempdir().unwrap();
    // No `.dockvirt` anywhere above a fresh temp dir and no overrides:
    // `name` is unresolvable.
    let project = tempfile::tempdir().unwrap();
    dockvirt(&home)
        .current_dir(project.path())
        .args(["up", "--image", "nginx:latest", "--domain", "x.local"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("name"));
}

#[test]
fn first_run_writes_default_catalog() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write_project(&project, "os=alpine99\n");

    dockvirt(&home)
        .current_dir(project.path())
        .arg("up")
        .assert()
        .code(2);

    let config = std::fs::read_to_string(home.path().join("config.yaml")).unwrap();
    assert!(config.contains("images:"));
    assert!(config.contains("default_os: ubuntu22.04"));
    assert!(!config.contains("os_images:"));
}

#[test]
fn invocations_are_logged() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    write_project(&project, "os=alpine99\n");

    dockvirt(&home)
        .current_dir(project.path())
        .arg("up")
        .assert()
        .code(2);

    let log = std::fs::read_to_string(home.path().join("cli.log")).unwrap();
    assert!(log.contains("dockvirt up"));
}

#[test]
fn check_prints_tool_table() {
    let home = tempfile::tempdir().unwrap();
    let output = dockvirt(&home).arg("check").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("TOOL"));
    assert!(stdout.contains("virsh"));
    assert!(stdout.contains("qemu:///session"));
    // 0 when every tool is present, 3 when something is missing; both are
    // legitimate depending on the host running the suite.
    let code = output.status.code().unwrap();
    assert!(code == 0 || code == 3, "unexpected exit code {code}");
}

#[test]
fn heal_reports_findings_without_apply() {
    let home = tempfile::tempdir().unwrap();
    let output = dockvirt(&home).arg("heal").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("catalog"));
    assert!(stdout.contains("templates"));
    let code = output.status.code().unwrap();
    assert!(code == 0 || code == 3, "unexpected exit code {code}");
}

#[test]
fn stack_deploy_rejects_missing_file() {
    let home = tempfile::tempdir().unwrap();
    dockvirt(&home)
        .args(["stack", "deploy", "/nonexistent/stack.yaml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("stack"));
}

#[test]
fn stack_deploy_rejects_cycles() {
    let home = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stack.yaml");
    std::fs::write(
        &file,
        "vms:\n  - name: a\n    domain: a.local\n    image: x\n    depends_on: [b]\n  - name: b\n    domain: b.local\n    image: y\n    depends_on: [a]\n",
    )
    .unwrap();

    dockvirt(&home)
        .args(["stack", "deploy"])
        .arg(&file)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn usage_errors_exit_2() {
    let home = tempfile::tempdir().unwrap();
    dockvirt(&home).arg("ip").assert().code(2);
    dockvirt(&home).arg("no-such-verb").assert().code(2);
}
