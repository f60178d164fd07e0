//! Subprocess transport (C4): owns exactly one child agent process and its
//! stdio pipes, the stdout/stderr pump tasks, and command-line assembly
//! mitigation (§4.4).

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::{ControlProtocol, LineWriter};
use crate::error::{Error, Result};
use crate::hooks::HookProcessor;
use crate::mcp_bridge::{McpBridge, McpServerRegistry, NoMcpBridge};
use crate::options::{ClaudeAgentOptions, HookEvent, HookMatcher};
use crate::parser::Parser;
use crate::types::Message;

/// Windows argv length threshold past which command-length mitigation
/// kicks in (§4.4.1).
const WINDOWS_ARGV_LIMIT: usize = 8_000;
/// Threshold on every other platform.
const OTHER_ARGV_LIMIT: usize = 100_000;

/// Bound on the diagnostic (stderr) channel; lines are dropped, never
/// blocking the pump, once it fills (§4.4.3).
const STDERR_CHANNEL_CAPACITY: usize = 256;
/// Bound on the parsed-message channel.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Unconnected,
    Connected,
    Closed,
}

/// The transport surface [`crate::Client`] drives a session through (§4.7).
/// [`SubprocessTransport`] is the only implementation this crate ships;
/// the trait exists so a caller can substitute a fake for
/// [`crate::with_client_transport`] / [`crate::Client::from_transport`] in
/// tests without spawning a real `claude` process.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn send_message(&self, msg: &Value) -> Result<()>;
    async fn next_message(&self) -> Option<Message>;
    async fn next_error(&self) -> Option<Error>;
    async fn interrupt(&self) -> Result<()>;
    async fn set_permission_mode(&self, mode: crate::options::PermissionMode) -> Result<()>;
    async fn set_model(&self, model: Option<String>) -> Result<()>;
    async fn get_mcp_status(&self) -> Result<Value>;
    async fn rewind_files(&self, user_message_id: String) -> Result<Value>;
    async fn get_server_info(&self) -> Result<Value>;
    async fn close(&self) -> Result<()>;
}

/// Owns the child process, its stdio pumps, and (in streaming mode) the
/// control protocol layered on top of them.
pub struct SubprocessTransport {
    binary: PathBuf,
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    entrypoint: &'static str,
    sdk_version: &'static str,
    enable_file_checkpointing: bool,
    stream_close_timeout: Duration,
    needs_stdin: bool,
    streaming: bool,
    hooks_config: HashMap<HookEvent, Vec<HookMatcher>>,
    mcp_bridge: Arc<dyn McpBridge>,

    state: Mutex<TransportState>,
    child: Mutex<Option<Child>>,
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    control: Mutex<Option<Arc<ControlProtocol>>>,
    hooks: Arc<HookProcessor>,
    parser: Arc<Parser>,
    message_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    error_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    first_result_received: CancellationToken,
    pump_handles: Mutex<Vec<JoinHandle<()>>>,
    temp_files: Mutex<Vec<PathBuf>>,
    keep_stdin_open: AtomicBool,
}

struct StdinWriter(mpsc::UnboundedSender<String>);

#[async_trait]
impl LineWriter for StdinWriter {
    async fn write_line(&self, line: String) -> Result<()> {
        self.0
            .send(line)
            .map_err(|_| Error::NotConnected)
    }
}

impl SubprocessTransport {
    /// `argv` is the flag list already assembled by C8; `needs_stdin` is
    /// false only for one-shot invocations that pass the prompt as an argv
    /// element. `keep_stdin_open` should be set when the session declares
    /// hooks or an in-process SDK-MCP server (§4.4.5).
    pub fn new(
        options: &ClaudeAgentOptions,
        binary: PathBuf,
        argv: Vec<String>,
        streaming: bool,
        needs_stdin: bool,
        keep_stdin_open: bool,
        hooks: Arc<HookProcessor>,
    ) -> Self {
        let mcp_bridge: Arc<dyn McpBridge> = if options.mcp_servers.is_empty() {
            Arc::new(NoMcpBridge)
        } else {
            Arc::new(McpServerRegistry::new(options.mcp_servers.clone()))
        };
        Self {
            binary,
            argv,
            working_dir: options.working_dir.clone(),
            env: options.env.clone(),
            entrypoint: if streaming { "sdk-rust-client" } else { "sdk-rust" },
            sdk_version: env!("CARGO_PKG_VERSION"),
            enable_file_checkpointing: options.enable_file_checkpointing,
            stream_close_timeout: options.stream_close_timeout(),
            needs_stdin,
            streaming,
            hooks_config: options.hooks.clone(),
            mcp_bridge,
            state: Mutex::new(TransportState::Unconnected),
            child: Mutex::new(None),
            stdin_tx: Mutex::new(None),
            control: Mutex::new(None),
            hooks,
            parser: Arc::new(Parser::new(options.max_buffer_size)),
            message_rx: Mutex::new(None),
            error_rx: Mutex::new(None),
            first_result_received: CancellationToken::new(),
            pump_handles: Mutex::new(Vec::new()),
            temp_files: Mutex::new(Vec::new()),
            keep_stdin_open: AtomicBool::new(keep_stdin_open),
        }
    }

    /// Command-line length mitigation (§4.4.1): externalizes the `--agents`
    /// payload to a temp file and rewrites the flag to `@<path>` if the
    /// assembled command would otherwise exceed the platform threshold.
    fn mitigate_command_length(argv: &mut Vec<String>, temp_files: &mut Vec<PathBuf>) -> Result<()> {
        let limit = if cfg!(windows) {
            WINDOWS_ARGV_LIMIT
        } else {
            OTHER_ARGV_LIMIT
        };
        let total_len: usize = argv.iter().map(|a| a.len() + 1).sum();
        if total_len <= limit {
            return Ok(());
        }

        let Some(idx) = argv.iter().position(|a| a == "--agents") else {
            return Err(Error::CommandTooLong);
        };
        let Some(value) = argv.get(idx + 1).cloned() else {
            return Err(Error::CommandTooLong);
        };

        let mut file = tempfile::Builder::new()
            .prefix("claude-agents-")
            .tempfile()
            .map_err(Error::Io)?;
        file.write_all(value.as_bytes()).map_err(Error::Io)?;
        file.flush().map_err(Error::Io)?;
        let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;

        argv[idx + 1] = format!("@{}", path.display());
        temp_files.push(path);
        Ok(())
    }

    fn build_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("CLAUDE_CODE_ENTRYPOINT".to_string(), self.entrypoint.to_string());
        env.insert("CLAUDE_AGENT_SDK_VERSION".to_string(), self.sdk_version.to_string());
        if self.enable_file_checkpointing {
            env.insert(
                "CLAUDE_CODE_ENABLE_SDK_FILE_CHECKPOINTING".to_string(),
                "true".to_string(),
            );
        }
        for (k, v) in &self.env {
            env.insert(k.clone(), v.clone());
        }
        // Avoid any updater side effects by default; callers may override explicitly.
        env.entry("DISABLE_AUTOUPDATER".to_string())
            .or_insert_with(|| "1".to_string());
        env
    }

    /// Unconnected -> Connected (§4.4.8). Spawns the child, starts the
    /// stdout/stderr pumps, and (in streaming mode) constructs the control
    /// protocol and runs its `initialize` handshake.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != TransportState::Unconnected {
                return Err(Error::AlreadyConnected);
            }
            *state = TransportState::Connected;
        }

        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return Err(Error::InvalidWorkingDirectory(dir.clone()));
            }
        }

        let mut argv = self.argv.clone();
        let mut temp_files = Vec::new();
        Self::mitigate_command_length(&mut argv, &mut temp_files)?;
        *self.temp_files.lock().await = temp_files;

        let mut command = Command::new(&self.binary);
        command.args(&argv);
        command.envs(self.build_env());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.stdin(if self.needs_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(Error::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(Error::MissingStderr)?;
        let stdin = if self.needs_stdin {
            Some(child.stdin.take().ok_or(Error::MissingStdin)?)
        } else {
            None
        };

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(STDERR_CHANNEL_CAPACITY);
        *self.message_rx.lock().await = Some(message_rx);
        *self.error_rx.lock().await = Some(error_rx);

        let control = if self.streaming {
            let (stdin_tx, writer) = Self::spawn_stdin_writer(stdin);
            *self.stdin_tx.lock().await = Some(stdin_tx);
            let control = Arc::new(ControlProtocol::with_mcp_bridge(
                Arc::new(writer),
                Arc::clone(&self.hooks),
                Arc::clone(&self.mcp_bridge),
            ));
            *self.control.lock().await = Some(Arc::clone(&control));
            Some(control)
        } else if let Some(stdin) = stdin {
            let (stdin_tx, writer) = Self::spawn_stdin_writer(Some(stdin));
            *self.stdin_tx.lock().await = Some(stdin_tx);
            let _ = writer;
            None
        } else {
            None
        };

        let pid = child.id();
        *self.child.lock().await = Some(child);

        let stdout_handle = self.spawn_stdout_pump(stdout, message_tx.clone(), error_tx.clone(), control.clone());
        let stderr_handle = self.spawn_stderr_pump(stderr, error_tx.clone());
        *self.pump_handles.lock().await = vec![stdout_handle, stderr_handle];

        debug!(pid, "spawned claude agent process");

        if let Some(control) = &control {
            let timeout = self.stream_close_timeout.max(Duration::from_secs(60));
            control.initialize(&self.hooks_config, timeout).await?;
        }

        Ok(())
    }

    fn spawn_stdin_writer(stdin: Option<ChildStdin>) -> (mpsc::UnboundedSender<String>, StdinWriter) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }
        (tx.clone(), StdinWriter(tx))
    }

    fn spawn_stdout_pump(
        &self,
        stdout: tokio::process::ChildStdout,
        message_tx: mpsc::Sender<Message>,
        error_tx: mpsc::Sender<Error>,
        control: Option<Arc<ControlProtocol>>,
    ) -> JoinHandle<()> {
        let parser = Arc::clone(&self.parser);
        let first_result_received = self.first_result_received.clone();
        let streaming = self.streaming;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let shallow: Option<Value> = serde_json::from_str(&line).ok();
                        let type_tag = shallow.as_ref().and_then(|v| v.get("type")).and_then(Value::as_str);
                        let is_control = matches!(
                            type_tag,
                            Some("control_request") | Some("control_response") | Some("control_cancel_request")
                        );
                        if streaming && is_control {
                            if let (Some(control), Some(value)) = (&control, shallow) {
                                ControlProtocol::handle_inbound_line(control, value).await;
                            }
                            continue;
                        }

                        match parser.process_line(&line) {
                            Ok(messages) => {
                                for message in messages {
                                    if message.is_result() {
                                        first_result_received.cancel();
                                    }
                                    if message_tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = error_tx.try_send(e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = error_tx.try_send(Error::StdoutRead(e));
                        break;
                    }
                }
            }
            if let Some(control) = &control {
                control.fail_pending_requests(&Error::ProcessExited("stdout closed".to_string())).await;
            }
        })
    }

    fn spawn_stderr_pump(&self, stderr: tokio::process::ChildStderr, error_tx: mpsc::Sender<Error>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                warn!(target: "claude_agent_sdk::stderr", "{line}");
                // Bounded and non-blocking: dropped if the channel is full,
                // never the pump (§4.4.3).
                let _ = error_tx.try_send(Error::ProcessExited(line));
            }
        })
    }

    /// Serializes `msg`, appends `\n`, writes to stdin. No-op if stdin was
    /// never opened (one-shot, prompt passed on argv) (§4.4.4).
    pub async fn send_message(&self, msg: &Value) -> Result<()> {
        let tx = self.stdin_tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            return Ok(());
        };
        tx.send(msg.to_string()).map_err(|_| Error::NotConnected)
    }

    /// Closes stdin immediately, dropping the writer task.
    pub async fn end_input(&self) -> Result<()> {
        *self.stdin_tx.lock().await = None;
        Ok(())
    }

    /// Whether this transport was configured to keep stdin open past the
    /// prompt (one-shot session with hooks or an SDK-MCP server, §4.4.5).
    pub fn keeps_stdin_open(&self) -> bool {
        self.keep_stdin_open.load(Ordering::SeqCst)
    }

    /// Defers stdin closure to the first `ResultMessage` or
    /// `CLAUDE_CODE_STREAM_CLOSE_TIMEOUT`, whichever comes first (§4.4.5).
    /// Callers that configured `keep_stdin_open` must call this — a bare
    /// `&self` can't spawn a task that outlives the call, so this takes an
    /// explicit `Arc` handle, mirroring [`ControlProtocol::handle_inbound_line`].
    pub fn defer_stdin_close(transport: &Arc<Self>) {
        if !transport.keep_stdin_open.load(Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(transport);
        tokio::spawn(async move {
            let _ = tokio::time::timeout(
                transport.stream_close_timeout,
                transport.first_result_received.cancelled(),
            )
            .await;
            let _ = transport.end_input().await;
        });
    }

    pub async fn next_message(&self) -> Option<Message> {
        let mut rx = self.message_rx.lock().await;
        rx.as_mut()?.recv().await
    }

    pub async fn next_error(&self) -> Option<Error> {
        let mut rx = self.error_rx.lock().await;
        match rx.as_mut() {
            Some(rx) => rx.try_recv().ok(),
            None => None,
        }
    }

    async fn require_connected(&self) -> Result<()> {
        if *self.state.lock().await != TransportState::Connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn control(&self) -> Result<Arc<ControlProtocol>> {
        self.require_connected().await?;
        self.control
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::ControlProtocol("control protocol not initialized - streaming mode required".to_string()))
    }

    pub async fn interrupt(&self) -> Result<()> {
        let control = self.control().await?;
        control
            .send_subtype_request("interrupt", Default::default(), self.stream_close_timeout)
            .await?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, mode: crate::options::PermissionMode) -> Result<()> {
        let control = self.control().await?;
        let mut fields = serde_json::Map::new();
        fields.insert("mode".to_string(), serde_json::to_value(mode)?);
        control.send_subtype_request("set_permission_mode", fields, self.stream_close_timeout).await?;
        Ok(())
    }

    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        let control = self.control().await?;
        let mut fields = serde_json::Map::new();
        fields.insert("model".to_string(), model.map(Value::String).unwrap_or(Value::Null));
        control.send_subtype_request("set_model", fields, self.stream_close_timeout).await?;
        Ok(())
    }

    pub async fn get_mcp_status(&self) -> Result<Value> {
        let control = self.control().await?;
        control.send_subtype_request("mcp_status", Default::default(), self.stream_close_timeout).await
    }

    pub async fn rewind_files(&self, user_message_id: String) -> Result<Value> {
        if !self.enable_file_checkpointing {
            return Err(Error::ControlProtocol(
                "control protocol not initialized - streaming mode required".to_string(),
            ));
        }
        let control = self.control().await?;
        let mut fields = serde_json::Map::new();
        fields.insert("user_message_id".to_string(), Value::String(user_message_id));
        control.send_subtype_request("rewind_files", fields, self.stream_close_timeout).await
    }

    pub async fn get_server_info(&self) -> Result<Value> {
        let control = self.control().await?;
        control.send_subtype_request("get_server_info", Default::default(), self.stream_close_timeout).await
    }

    /// Idempotent (§4.4.6): cancels the control protocol, closes stdin,
    /// joins the pumps with a 5s ceiling, sends SIGTERM then (after 5s)
    /// SIGKILL, and removes any temp files.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == TransportState::Closed {
                return Ok(());
            }
            *state = TransportState::Closed;
        }

        if let Some(control) = self.control.lock().await.take() {
            control.close().await;
        }
        *self.stdin_tx.lock().await = None;

        let handles: Vec<_> = self.pump_handles.lock().await.drain(..).collect();
        let _ = tokio::time::timeout(Duration::from_secs(5), futures_join_all(handles)).await;

        if let Some(mut child) = self.child.lock().await.take() {
            terminate_child(&mut child).await;
        }

        for path in self.temp_files.lock().await.drain(..) {
            let _ = std::fs::remove_file(path);
        }

        Ok(())
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&self) -> Result<()> {
        SubprocessTransport::connect(self).await
    }

    async fn send_message(&self, msg: &Value) -> Result<()> {
        SubprocessTransport::send_message(self, msg).await
    }

    async fn next_message(&self) -> Option<Message> {
        SubprocessTransport::next_message(self).await
    }

    async fn next_error(&self) -> Option<Error> {
        SubprocessTransport::next_error(self).await
    }

    async fn interrupt(&self) -> Result<()> {
        SubprocessTransport::interrupt(self).await
    }

    async fn set_permission_mode(&self, mode: crate::options::PermissionMode) -> Result<()> {
        SubprocessTransport::set_permission_mode(self, mode).await
    }

    async fn set_model(&self, model: Option<String>) -> Result<()> {
        SubprocessTransport::set_model(self, model).await
    }

    async fn get_mcp_status(&self) -> Result<Value> {
        SubprocessTransport::get_mcp_status(self).await
    }

    async fn rewind_files(&self, user_message_id: String) -> Result<Value> {
        SubprocessTransport::rewind_files(self, user_message_id).await
    }

    async fn get_server_info(&self) -> Result<Value> {
        SubprocessTransport::get_server_info(self).await
    }

    async fn close(&self) -> Result<()> {
        SubprocessTransport::close(self).await
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Graceful termination: SIGTERM, then SIGKILL after a 5s grace period on
/// Unix; `start_kill` only on other platforms (§4.4.6). "process already
/// finished" / "no child processes" style errors are swallowed.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}
