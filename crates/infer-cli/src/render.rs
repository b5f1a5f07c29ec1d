//! Plain-text rendering of core events

use infer_core::agent::{ApprovalAction, ApprovalRequest, ChatEvent};
use infer_core::shells::ShellInfo;

const ARGUMENT_PREVIEW_CHARS: usize = 200;

/// Text to print for an event, if any. Text deltas come back unterminated
/// so they can be streamed as-is.
pub(crate) fn render(event: &ChatEvent) -> Option<String> {
    let text = match event {
        ChatEvent::TextDelta { delta } => delta.clone(),
        ChatEvent::StreamError { error, .. } => format!("\n[stream error] {}\n", error),
        ChatEvent::ToolApprovalRequested { request, .. } => approval_prompt(request),
        ChatEvent::ToolDenied { reason, .. } => format!("  ✗ denied: {}\n", reason),
        ChatEvent::ToolExecuting { name, .. } => format!("\n⏺ {}\n", name),
        ChatEvent::ToolCompleted {
            name, duration_ms, ..
        } => format!("  ✓ {} ({} ms)\n", name, duration_ms),
        ChatEvent::ToolFailed { name, error, .. } => {
            let first = error.lines().next().unwrap_or_default();
            format!("  ✗ {}: {}\n", name, first)
        }
        ChatEvent::ModeChanged { mode } => format!("[mode: {}]\n", mode),
        ChatEvent::QueueDrained { count } => format!("[{} queued message(s) added]\n", count),
        ChatEvent::TurnLimitReached { max_turns } => {
            format!("\n[stopped after {} turns]\n", max_turns)
        }
        ChatEvent::Completed { .. } => "\n".to_string(),
        ChatEvent::Cancelled { .. } => "\n[cancelled]\n".to_string(),
        ChatEvent::Error { error, .. } => format!("\n[error] {}\n", error),
        ChatEvent::ShellDetached { shell } => {
            format!("[shell {} running in background: {}]\n", shell.id, shell.command)
        }
        ChatEvent::ShellCompleted { id, exit_code } => {
            format!("[shell {} finished{}]\n", id, exit_suffix(*exit_code))
        }
        ChatEvent::ShellFailed {
            id,
            exit_code,
            error,
        } => match error {
            Some(error) => format!("[shell {} failed: {}]\n", id, error),
            None => format!("[shell {} failed{}]\n", id, exit_suffix(*exit_code)),
        },
        ChatEvent::ShellCancelled { id } => format!("[shell {} cancelled]\n", id),
        _ => return None,
    };
    Some(text)
}

fn exit_suffix(exit_code: Option<i32>) -> String {
    exit_code
        .map(|code| format!(" with exit code {}", code))
        .unwrap_or_default()
}

fn approval_prompt(request: &ApprovalRequest) -> String {
    let call = &request.tool_call;
    let detail = match call.arguments.get("command").and_then(|c| c.as_str()) {
        Some(command) if call.name == "bash" => command.to_string(),
        _ => {
            let args = serde_json::to_string(&call.arguments).unwrap_or_default();
            truncate(&args, ARGUMENT_PREVIEW_CHARS)
        }
    };
    format!(
        "\n? Allow {} ({}/{}): {}\n  [y]es / [n]o / [a]lways > ",
        call.name,
        request.index + 1,
        request.total,
        detail
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Parse an answer to an approval prompt.
pub(crate) fn parse_approval(input: &str) -> Option<ApprovalAction> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalAction::Approve),
        "n" | "no" => Some(ApprovalAction::Reject),
        "a" | "always" => Some(ApprovalAction::AutoAcceptAll),
        _ => None,
    }
}

pub(crate) fn shell_line(shell: &ShellInfo) -> String {
    format!(
        "{}  {:<9}  {:>6}s  {}",
        shell.id,
        shell.state.to_string(),
        shell.elapsed_ms / 1000,
        shell.command
    )
}
