//! S4: a streaming session round-trips the `initialize` handshake and an
//! `interrupt` request through the control protocol against a fake agent
//! that speaks it directly.

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    use claude_agent_sdk::{Client, ClaudeAgentOptions};
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

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

init_req = json.loads(sys.stdin.readline())
send({"type": "control_response", "response": {"subtype": "success", "request_id": init_req["request_id"], "response": {}}})
send({"type": "system", "subtype": "init", "session_id": "s1"})

sys.stdin.readline()  # the user turn
send({"type": "assistant", "content": [{"type": "text", "text": "hi"}], "model": "test-model"})

interrupt_req = json.loads(sys.stdin.readline())
send({"type": "control_response", "response": {"subtype": "success", "request_id": interrupt_req["request_id"], "response": {}}})

send({"type": "result", "subtype": "success", "duration_ms": 1, "duration_api_ms": 1, "is_error": False, "num_turns": 1, "session_id": "s1"})
"#;

    #[tokio::test]
    async fn interrupt_round_trips_and_session_reaches_result() {
        let dir = TempDir::new().expect("temp dir");
        let script_path = write_fake_agent(&dir, FAKE_AGENT);

        let options = ClaudeAgentOptions {
            binary: Some(script_path),
            stream_close_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let client = Client::new(options).expect("build client");
        client.connect(Vec::new()).await.expect("connect performs the initialize handshake");

        client.query("hi").await.expect("send user turn");
        client.interrupt().await.expect("interrupt round-trips");

        let mut stream = client.receive_response().await;
        let mut saw_result = false;
        while let Some(message) = stream.next().await {
            let message = message.expect("no transport errors");
            if message.is_result() {
                saw_result = true;
            }
        }
        assert!(saw_result, "receive_response must terminate at the ResultMessage");

        client.disconnect().await.expect("disconnect");
        client.disconnect().await.expect("disconnect is idempotent");
    }
}
