//! End-to-end tests: config loading from disk, local task execution
//! through the runner, and the CLI surface

use assert_cmd::Command;
use fleetrun::{Config, Runner, Script};
use predicates::prelude::*;
use std::fs;
use std::sync::{Arc, Mutex};

/// Write half of a shared capture buffer, used as the runner's sink
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn config_loads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Fleetfile.yaml");
    fs::write(
        &path,
        r#"
servers:
  app:
    host: app.example.com
    user: deploy
tasks:
  status:
    description: "Service status"
    on: [app]
    scripts:
      - run: systemctl status app --no-pager
"#,
    )
    .unwrap();

    let config = Config::load(Some(path.as_path())).unwrap();
    assert_eq!(config.servers["app"].address(), Some("app.example.com"));
    assert_eq!(
        config.tasks["status"].scripts[0],
        Script::Run("systemctl status app --no-pager".into())
    );
}

#[test]
fn runner_executes_local_steps_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker.txt");

    let yaml = format!(
        r#"
servers:
  ctl:
    host: ctl.invalid
tasks:
  build:
    on: [ctl]
    scripts:
      - local: echo first > "{marker}"
      - local: echo second >> "{marker}"
"#,
        marker = marker.display()
    );

    let config = Config::from_str(&yaml).unwrap();
    let mut runner = Runner::new(config);
    let capture = Capture::default();
    runner.set_output(Box::new(capture.clone()));

    runner.run("build", None).unwrap();

    let written = fs::read_to_string(&marker).unwrap();
    assert_eq!(written, "first\nsecond\n");
    assert!(capture.contents().contains("Task completed"));
}

#[test]
fn multi_host_server_fans_out_in_declared_order() {
    let yaml = r#"
servers:
  web:
    hosts: [h1.invalid, h2.invalid, h3.invalid]
tasks:
  fanout:
    on: [web]
    parallel: true
    scripts:
      - local: echo up
"#;

    let config = Config::from_str(yaml).unwrap();
    let mut runner = Runner::new(config);
    let capture = Capture::default();
    runner.set_output(Box::new(capture.clone()));

    runner.run("fanout", None).unwrap();

    let output = capture.contents();
    let positions: Vec<usize> = (0..3)
        .map(|i| {
            output
                .find(&format!("[web[{}]]", i))
                .expect("expanded host banner")
        })
        .collect();
    assert!(positions[0] < positions[1] && positions[1] < positions[2]);
    assert!(output.contains("All 3 host(s) completed"));
}

#[test]
fn init_writes_example_config_once() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("fleetrun")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created Fleetfile.yaml"));

    // The generated example must itself be loadable
    let generated = dir.path().join("Fleetfile.yaml");
    let config = Config::load(Some(generated.as_path())).unwrap();
    assert!(config.tasks.contains_key("deploy"));

    Command::cargo_bin("fleetrun")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn list_names_configured_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Fleetfile.yaml");
    fs::write(
        &path,
        r#"
servers:
  app:
    host: app.example.com
tasks:
  deploy:
    description: "Ship it"
    on: [app]
    scripts:
      - run: "true"
  logs:
    on: [app]
    scripts:
      - run: journalctl -u app -n 50
"#,
    )
    .unwrap();

    Command::cargo_bin("fleetrun")
        .unwrap()
        .arg("-c")
        .arg(&path)
        .arg("list")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("deploy")
                .and(predicate::str::contains("Ship it"))
                .and(predicate::str::contains("logs"))
                .and(predicate::str::contains("(no description)")),
        );
}

#[test]
fn run_reports_unknown_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Fleetfile.yaml");
    fs::write(&path, "servers: {}\ntasks: {}\n").unwrap();

    Command::cargo_bin("fleetrun")
        .unwrap()
        .arg("-c")
        .arg(&path)
        .arg("run")
        .arg("nosuch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("task 'nosuch' not found"));
}

#[test]
fn run_executes_local_task_via_cli() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Fleetfile.yaml");
    fs::write(
        &path,
        r#"
servers:
  ctl:
    host: ctl.invalid
tasks:
  hello:
    on: [ctl]
    scripts:
      - local: echo hello from fleetrun
"#,
    )
    .unwrap();

    Command::cargo_bin("fleetrun")
        .unwrap()
        .arg("-c")
        .arg(&path)
        .arg("run")
        .arg("hello")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from fleetrun"));
}
