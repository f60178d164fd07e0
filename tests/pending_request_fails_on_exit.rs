//! A control request pending when the agent process exits fails promptly —
//! it does not wait out the full control timeout.

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    use claude_agent_sdk::{Client, ClaudeAgentOptions, Error};
    use tempfile::TempDir;

    fn write_fake_agent(dir: &TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("fake-claude");
        fs::write(&path, script).expect("write fake agent");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    const FAKE_AGENT: &str = r#"#!/usr/bin/env python3
import sys, json

init_req = json.loads(sys.stdin.readline())
sys.stdout.write(json.dumps({
    "type": "control_response",
    "response": {"subtype": "success", "request_id": init_req["request_id"], "response": {}},
}) + "\n")
sys.stdout.flush()
# Exit immediately: closes stdout without ever answering the next request.
"#;

    #[tokio::test]
    async fn interrupt_fails_fast_instead_of_waiting_the_full_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let script_path = write_fake_agent(&dir, FAKE_AGENT);

        let options = ClaudeAgentOptions {
            binary: Some(script_path),
            // Deliberately long: if `interrupt` actually waited this out,
            // the outer 1s bound below would trip first.
            stream_close_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let client = Client::new(options).expect("build client");
        client.connect(Vec::new()).await.expect("connect");

        let outcome = tokio::time::timeout(Duration::from_secs(1), client.interrupt()).await;
        let result = outcome.expect("interrupt must resolve well within the control timeout");
        match result {
            Err(Error::ProcessExited(_)) | Err(Error::ControlProtocol(_)) => {}
            other => panic!("expected a process-exited style failure, got {other:?}"),
        }

        client.disconnect().await.expect("disconnect");
    }
}
