use jobdock::environment::{EnvironmentError, Provisioner};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn stub_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tool-stub");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn provisioner(path: &Path) -> Provisioner {
    Provisioner::new(path.display().to_string())
}

#[test]
fn display_parses_credential_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = stub_tool(
        dir.path(),
        r#"echo '{"result":{"provider_id":"00D000000000111AAA","principal":"scratch@example.com","instance_url":"https://scratch.example.com","access_token":"sek"}}'"#,
    );

    let details = provisioner(&stub).display("jobd-1").expect("display");
    assert_eq!(details.provider_id, "00D000000000111AAA");
    assert_eq!(details.principal, "scratch@example.com");
    assert_eq!(details.access_token, "sek");
    assert!(details.auth_url.is_none());
}

#[test]
fn nonzero_exit_surfaces_both_streams() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = stub_tool(
        dir.path(),
        "echo partial output\necho 'definition file not found' >&2\nexit 3",
    );

    let err = provisioner(&stub)
        .create_scratch("environments/dev.json", "jobd-2", 1)
        .expect_err("must fail");
    match err {
        EnvironmentError::Provisioning {
            exit_code,
            stdout,
            stderr,
            ..
        } => {
            assert_eq!(exit_code, Some(3));
            assert!(stdout.contains("partial output"));
            assert!(stderr.contains("definition file not found"));
        }
        other => panic!("expected Provisioning, got {other:?}"),
    }
}

#[test]
fn non_json_output_is_a_tool_output_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = stub_tool(dir.path(), "echo 'Deployed 14 components.'");

    let err = provisioner(&stub).logout("jobd-3").expect_err("must fail");
    assert!(matches!(err, EnvironmentError::ToolOutput { .. }));
}

#[test]
fn missing_binary_is_a_distinct_error() {
    let err = Provisioner::new("/nonexistent/jobdock-tool")
        .logout("jobd-4")
        .expect_err("must fail");
    assert!(matches!(err, EnvironmentError::MissingBinary { .. }));
}

#[test]
fn slow_tool_times_out_and_is_killed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = stub_tool(dir.path(), "sleep 5\necho '{\"result\":{}}'");

    let err = provisioner(&stub)
        .with_timeout(Duration::from_millis(200))
        .logout("jobd-5")
        .expect_err("must time out");
    assert!(matches!(err, EnvironmentError::ToolTimeout { .. }));
}

#[test]
fn run_command_passes_credentials_via_environment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = stub_tool(
        dir.path(),
        r#"printf '{"result":{"seen":"%s"}}' "$JOBDOCK_ACCESS_TOKEN""#,
    );

    let args: Vec<String> = ["project", "deploy", "--json"]
        .iter()
        .map(|part| part.to_string())
        .collect();
    let result = provisioner(&stub)
        .run_command(
            &args,
            &[("JOBDOCK_ACCESS_TOKEN".to_string(), "sekret".to_string())],
        )
        .expect("run");
    assert_eq!(result.get("seen").and_then(|v| v.as_str()), Some("sekret"));
}

#[test]
fn run_command_keeps_each_argument_intact() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Reports argc and the last argument so splitting or re-quoting shows up.
    let stub = stub_tool(
        dir.path(),
        r#"last=""
for arg in "$@"; do last="$arg"; done
printf '{"result":{"argc":%d,"last":"%s"}}' $# "$last""#,
    );

    let args: Vec<String> = ["project", "deploy", "--path", "force app/main"]
        .iter()
        .map(|part| part.to_string())
        .collect();
    let result = provisioner(&stub).run_command(&args, &[]).expect("run");
    assert_eq!(result.get("argc").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(
        result.get("last").and_then(|v| v.as_str()),
        Some("force app/main")
    );
}
