//! CLI discovery and flag assembly (C8, a thin boundary — §1 scopes full CLI
//! wrapping, MCP server configuration, and packaging out of this crate).

use std::env;
use std::path::PathBuf;

use crate::options::{ClaudeAgentOptions, PermissionMode};

/// Resolves the agent binary: explicit option, then `CLAUDE_BINARY`, then
/// the bare `claude` name (resolved against `PATH` by the OS), matching the
/// teacher's `ClaudeClient::resolve_binary`.
pub fn resolve_binary(options: &ClaudeAgentOptions) -> PathBuf {
    if let Some(binary) = &options.binary {
        return binary.clone();
    }
    if let Ok(binary) = env::var("CLAUDE_BINARY") {
        if !binary.is_empty() {
            return PathBuf::from(binary);
        }
    }
    PathBuf::from("claude")
}

fn permission_mode_arg(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default => "default",
        PermissionMode::AcceptEdits => "acceptEdits",
        PermissionMode::Plan => "plan",
        PermissionMode::BypassPermissions => "bypassPermissions",
    }
}

/// Assembles the flag portion of argv shared by one-shot and streaming
/// sessions. Both modes speak stream-json on stdout; input format is
/// stream-json unless the one-shot prompt is passed as an argv element.
pub fn build_argv(options: &ClaudeAgentOptions, prompt_on_argv: Option<&str>) -> Vec<String> {
    let mut argv = Vec::new();

    argv.push("--output-format".to_string());
    argv.push("stream-json".to_string());
    argv.push("--verbose".to_string());

    if prompt_on_argv.is_none() {
        argv.push("--input-format".to_string());
        argv.push("stream-json".to_string());
    }

    if let Some(model) = &options.model {
        argv.push("--model".to_string());
        argv.push(model.clone());
    }
    if let Some(model) = &options.fallback_model {
        argv.push("--fallback-model".to_string());
        argv.push(model.clone());
    }
    if let Some(prompt) = &options.system_prompt {
        argv.push("--system-prompt".to_string());
        argv.push(prompt.clone());
    }
    if let Some(prompt) = &options.append_system_prompt {
        argv.push("--append-system-prompt".to_string());
        argv.push(prompt.clone());
    }
    if !options.allowed_tools.is_empty() {
        argv.push("--allowedTools".to_string());
        argv.push(options.allowed_tools.join(","));
    }
    if !options.disallowed_tools.is_empty() {
        argv.push("--disallowedTools".to_string());
        argv.push(options.disallowed_tools.join(","));
    }

    argv.push("--permission-mode".to_string());
    argv.push(permission_mode_arg(options.permission_mode).to_string());

    if let Some(name) = &options.permission_prompt_tool_name {
        argv.push("--permission-prompt-tool".to_string());
        argv.push(name.clone());
    }

    for dir in &options.add_dirs {
        argv.push("--add-dir".to_string());
        argv.push(dir.display().to_string());
    }

    if options.include_partial_messages {
        argv.push("--include-partial-messages".to_string());
    }

    if let Some(local) = options.plugins.iter().find_map(|p| match p {
        crate::options::PluginConfig::Local { path } => Some(path),
        crate::options::PluginConfig::Other => None,
    }) {
        argv.push("--agents".to_string());
        argv.push(local.display().to_string());
    }

    argv.extend(options.extra_args.iter().cloned());

    if let Some(prompt) = prompt_on_argv {
        argv.push("--print".to_string());
        argv.push(prompt.to_string());
    }

    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_falls_back_to_bare_claude() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            env::remove_var("CLAUDE_BINARY");
        }
        let options = ClaudeAgentOptions::default();
        assert_eq!(resolve_binary(&options), PathBuf::from("claude"));
    }

    #[test]
    fn resolve_binary_prefers_explicit_option_over_env() {
        let options = ClaudeAgentOptions {
            binary: Some(PathBuf::from("/opt/claude")),
            ..Default::default()
        };
        assert_eq!(resolve_binary(&options), PathBuf::from("/opt/claude"));
    }

    #[test]
    fn streaming_argv_requests_stream_json_both_ways() {
        let options = ClaudeAgentOptions::default();
        let argv = build_argv(&options, None);
        assert!(argv.windows(2).any(|w| w == ["--input-format", "stream-json"]));
        assert!(argv.windows(2).any(|w| w == ["--output-format", "stream-json"]));
    }

    #[test]
    fn one_shot_prompt_on_argv_omits_input_format_flag() {
        let options = ClaudeAgentOptions::default();
        let argv = build_argv(&options, Some("hello"));
        assert!(!argv.iter().any(|a| a == "--input-format"));
        assert_eq!(argv.last().map(String::as_str), Some("hello"));
    }
}
