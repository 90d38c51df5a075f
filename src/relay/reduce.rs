//! Reduction of a finished run's messages into display text.

use crate::rpc::{AgentMessage, ContentPart, Role, StopReason};

/// Prefix for text the agent wrote before calling a tool.
pub const THINKING_PREFIX: &str = "🤔 ";

/// Line placed before the final answer when earlier output exists.
pub const ANSWER_SEPARATOR: &str = "----------✅----------";

/// Reduce `agent_end` messages to the text shown to the user.
///
/// Only assistant messages with text are rendered. Tool calls and tool
/// results are logged and left out.
#[must_use]
pub fn reduce_messages(messages: &[AgentMessage]) -> String {
    let mut rendered: Vec<String> = Vec::new();

    for message in messages {
        match message.role {
            Role::Assistant => {
                log_tool_calls(message);

                let text = message.text_parts().collect::<Vec<_>>().join("\n");
                if text.is_empty() {
                    continue;
                }

                let entry = match message.stop_reason {
                    Some(StopReason::ToolUse) => format!("{THINKING_PREFIX}{text}"),
                    Some(StopReason::Stop) if !rendered.is_empty() => {
                        format!("{ANSWER_SEPARATOR}\n{text}")
                    }
                    _ => text,
                };
                rendered.push(entry);
            }
            Role::ToolResult => {
                let output = message.text_parts().collect::<Vec<_>>().join("\n");
                tracing::debug!(
                    tool = message.tool_name.as_deref().unwrap_or("unknown"),
                    output = %output,
                    "Tool result"
                );
            }
            Role::User | Role::Other => {}
        }
    }

    rendered.join("\n")
}

fn log_tool_calls(message: &AgentMessage) {
    for part in &message.content {
        if let ContentPart::ToolCall {
            name, arguments, ..
        } = part
        {
            tracing::info!(tool = %name, arguments = %arguments, "Agent tool call");
        }
    }
}
