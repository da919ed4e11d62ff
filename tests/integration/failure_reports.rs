use crate::common::*;
use std::net::TcpListener;
use std::time::Duration;

#[tokio::test]
async fn exhausted_ports_write_a_report_and_exit_for_operator() {
    let ports = free_ports(3);
    let (core, ui, base) = (ports[0], ports[1], ports[2]);
    let _busy = TcpListener::bind(("127.0.0.1", core)).unwrap();
    let _busy_fallback = TcpListener::bind(("127.0.0.1", base)).unwrap();

    let project = TestProject::new(&format!(
        r#"
[project]
name = "exhausted"
[ports]
fallback_base = {base}

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

    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["start", "-f", project.path()])
        .env("PAYMENT_SECRET_KEY", "sk_live_abcdefghijklmnop")
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Diagnostic report:"), "{stderr}");

    let reports = project.reports();
    assert_eq!(reports.len(), 1, "{reports:?}");
    let md = std::fs::read_to_string(&reports[0]).unwrap();
    assert!(md.contains("port-conflict (retryable: no)"));
    assert!(md.contains("| core | not-started |"));
    assert!(md.contains("PAYMENT_SECRET_KEY=sk_l…op (24 chars)"));
    assert!(!md.contains("sk_live_abcdefghijklmnop"));

    let state = project.state().unwrap();
    assert_eq!(state["phase"], "failed");
    assert!(state["report_path"].as_str().unwrap().ends_with(".md"));
}

#[tokio::test]
async fn unhealthy_backend_times_out_and_is_killed() {
    let ports = free_ports(2);
    let (core, ui) = (ports[0], ports[1]);
    let marker = tempfile::NamedTempFile::new().unwrap();
    let marker_path = marker.path().to_str().unwrap().to_string();

    // Never binds its port; writes its pid so the test can check it died.
    let project = TestProject::new(&format!(
        r#"
[project]
name = "timeout"
[timeouts]
health = "1s"
kill_grace = "1s"

[[services]]
name = "core"
command = "sh"
args = ["-c", "echo $$ > {marker_path}; echo booting core; exec sleep 60"]
port = {core}

[[services]]
name = "ui"
kind = "ui"
{ui_cmd}
"#,
        ui_cmd = http_server_command(ui),
    ));

    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_kioskboot"))
        .args(["start", "-f", project.path()])
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let md = std::fs::read_to_string(&project.reports()[0]).unwrap();
    assert!(md.contains("launch-timeout (retryable: yes)"));
    assert!(md.contains("| core | failed |"));
    assert!(md.contains("| ui | not-started |"));
    assert!(md.contains("booting core"), "core log tail missing:\n{md}");

    let pid: i32 = std::fs::read_to_string(marker.path())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err(),
        "backend {pid} survived rollback"
    );
    assert!(wait_for_port_release(ui, Duration::from_secs(1)).await);
}
