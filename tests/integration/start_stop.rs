use crate::common::*;
use std::time::Duration;
use tokio::process::Command;

fn kiosk_config(core: u16, ui: u16) -> String {
    format!(
        r#"
[project]
name = "start-stop"

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
    )
}

#[tokio::test]
async fn start_reaches_ready_and_interrupt_cleans_up() {
    let ports = free_ports(2);
    let (core, ui) = (ports[0], ports[1]);
    let project = TestProject::new(&kiosk_config(core, ui));

    let mut child = Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["start", "-f", project.path()])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start kioskboot");

    assert!(
        wait_for_phase(&project, "ready", Duration::from_secs(30)).await,
        "instance never became ready: {:?}",
        project.state()
    );
    let state = project.state().unwrap();
    assert_eq!(state["ui_url"], format!("http://127.0.0.1:{ui}"));
    assert_eq!(state["services"]["core"]["port"], core);
    assert!(state["services"]["core"]["pid"].is_u64());
    assert!(project.logs_dir().join("core.log").exists());
    assert!(project.logs_dir().join("bootstrap.log").exists());

    interrupt(&child);
    let status = tokio::time::timeout(Duration::from_secs(20), child.wait())
        .await
        .expect("kioskboot did not exit")
        .unwrap();
    assert!(status.success());

    assert!(wait_for_port_release(core, Duration::from_secs(5)).await);
    assert!(wait_for_port_release(ui, Duration::from_secs(5)).await);
    assert!(project.state().is_none(), "state.json left behind");
    assert!(project.reports().is_empty());
}

#[tokio::test]
async fn stop_command_shuts_down_running_instance() {
    let ports = free_ports(2);
    let (core, ui) = (ports[0], ports[1]);
    let project = TestProject::new(&kiosk_config(core, ui));

    let mut child = Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["start", "-f", project.path()])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start kioskboot");
    assert!(wait_for_phase(&project, "ready", Duration::from_secs(30)).await);

    let stop = Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["stop", "-f", project.path()])
        .output()
        .await
        .unwrap();
    assert!(stop.status.success(), "{}", String::from_utf8_lossy(&stop.stderr));

    let _ = tokio::time::timeout(Duration::from_secs(20), child.wait()).await;
    assert!(wait_for_port_release(core, Duration::from_secs(5)).await);
    assert!(wait_for_port_release(ui, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn running_backend_is_reused_not_respawned() {
    let ports = free_ports(2);
    let (core, ui) = (ports[0], ports[1]);
    let project = TestProject::new(&kiosk_config(core, ui));

    let mut external = Command::new("python3")
        .args(["-m", "http.server", &core.to_string(), "--bind", "127.0.0.1"])
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    assert!(wait_for_port(core, Duration::from_secs(10)).await);

    let mut child = Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["start", "-f", project.path()])
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    assert!(wait_for_phase(&project, "ready", Duration::from_secs(30)).await);

    let state = project.state().unwrap();
    assert_eq!(state["services"]["core"]["reused"], true);
    assert!(state["services"]["core"]["pid"].is_null());

    interrupt(&child);
    let _ = tokio::time::timeout(Duration::from_secs(20), child.wait()).await;

    // Reused servers are not ours to stop.
    assert!(external.try_wait().unwrap().is_none());
    external.kill().await.ok();
}
