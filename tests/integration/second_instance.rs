use crate::common::*;
use std::time::Duration;
use tokio::process::Command;

#[tokio::test]
async fn second_start_attaches_and_prints_ui_url() {
    let ports = free_ports(2);
    let (core, ui) = (ports[0], ports[1]);
    let project = TestProject::new(&format!(
        r#"
[project]
name = "attach"

[[services]]
name = "core"
{core_cmd}

[[services]]
name = "ui"
kind = "ui"
{ui_cmd}
"#,
        core_cmd = http_server_command(core),
        ui_cmd = http_server_command(ui),
    ));

    let mut first = Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["start", "-f", project.path()])
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    // state.json appears once the first process holds the instance lock.
    let start = std::time::Instant::now();
    while project.state().is_none() && start.elapsed() < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Launched while the first may still be starting: must wait, not spawn.
    let second = tokio::time::timeout(
        Duration::from_secs(40),
        Command::new(env!("CARGO_BIN_EXE_kioskboot"))
            .args(["start", "-f", project.path()])
            .output(),
    )
    .await
    .expect("second instance hung")
    .unwrap();

    assert!(second.status.success(), "{}", String::from_utf8_lossy(&second.stderr));
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains(&format!("http://127.0.0.1:{ui}")), "{stdout}");

    // Only the first process owns services.
    let state = project.state().unwrap();
    assert_eq!(state["pid"], first.id().unwrap());

    interrupt(&first);
    let _ = tokio::time::timeout(Duration::from_secs(20), first.wait()).await;
    assert!(wait_for_port_release(core, Duration::from_secs(5)).await);
}
