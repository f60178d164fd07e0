//! S2: a registered `PreToolUse` hook that denies is dispatched through the
//! control protocol and its decision reaches the agent verbatim.

#[cfg(unix)]
mod unix {
    use std::collections::HashMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    use claude_agent_sdk::{
        Client, ClaudeAgentOptions, HookCallback, HookContext, HookEvent, HookInput, HookMatcher,
    };

    struct DenyingHook;

    #[async_trait]
    impl HookCallback for DenyingHook {
        async fn call(&self, _input: HookInput, _context: HookContext) -> Map<String, Value> {
            let mut out = Map::new();
            out.insert("decision".to_string(), Value::String("block".to_string()));
            out.insert(
                "reason".to_string(),
                Value::String("denied by test".to_string()),
            );
            out
        }
    }

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
callback_id = init_req["request"]["hooks"]["PreToolUse"][0]["hookCallbackIds"][0]
send({"type": "control_response", "response": {"subtype": "success", "request_id": init_req["request_id"], "response": {}}})

send({"type": "system", "subtype": "init", "session_id": "s1"})
sys.stdin.readline()  # the user turn

send({
    "type": "control_request",
    "request_id": "areq_1",
    "request": {
        "subtype": "hook_callback",
        "callback_id": callback_id,
        "hook_event_name": "PreToolUse",
        "input": {"tool_name": "Bash", "command": "rm -rf /"},
        "tool_use_id": "tu1",
    },
})
reply = json.loads(sys.stdin.readline())
decision = reply["response"]["response"]["decision"]
reason = reply["response"]["response"]["reason"]

send({"type": "assistant", "content": [{"type": "text", "text": f"hook-{decision}:{reason}"}], "model": "test-model"})
send({"type": "result", "subtype": "success", "duration_ms": 1, "duration_api_ms": 1, "is_error": False, "num_turns": 1, "session_id": "s1"})
"#;

    #[tokio::test]
    async fn pre_tool_use_hook_deny_reaches_agent() {
        let dir = TempDir::new().expect("temp dir");
        let script_path = write_fake_agent(&dir, FAKE_AGENT);

        let mut hooks = HashMap::new();
        hooks.insert(
            HookEvent::PreToolUse,
            vec![HookMatcher {
                matcher: None,
                callbacks: vec![Arc::new(DenyingHook) as Arc<dyn HookCallback>],
                timeout: None,
            }],
        );
        let options = ClaudeAgentOptions {
            binary: Some(script_path),
            hooks,
            stream_close_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        let client = Client::new(options).expect("build client");
        client.connect(Vec::new()).await.expect("connect");
        client.query("please rm -rf /").await.expect("send turn");

        let mut stream = client.receive_response().await;
        let mut saw_denial = false;
        while let Some(message) = stream.next().await {
            let message = message.expect("no transport errors");
            if let claude_agent_sdk::Message::Assistant(assistant) = &message {
                for block in &assistant.content {
                    if let claude_agent_sdk::ContentBlock::Text { text } = block {
                        assert_eq!(text, "hook-block:denied by test");
                        saw_denial = true;
                    }
                }
            }
        }
        assert!(saw_denial, "expected the hook's deny decision to reach the agent");

        client.disconnect().await.expect("disconnect");
    }
}
