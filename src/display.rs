//! Colored terminal output for the relay front-end.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::rpc::UiRequest;

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to at most `max_len` bytes, adding an ellipsis if truncated.
///
/// Cuts on a character boundary so multi-byte text never splits.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.len() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }
    let mut end = max_len - 3;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Render a select option for display.
#[must_use]
pub fn format_option(option: &serde_json::Value, raw_mode: bool) -> String {
    match option {
        serde_json::Value::String(s) => truncate(s, 80, raw_mode),
        serde_json::Value::Object(map) => map
            .get("label")
            .or_else(|| map.get("value"))
            .and_then(serde_json::Value::as_str)
            .map_or_else(
                || truncate(&option.to_string(), 80, raw_mode),
                |s| truncate(s, 80, raw_mode),
            ),
        other => truncate(&other.to_string(), 80, raw_mode),
    }
}

/// Print that an agent was started for a chat.
pub fn print_session_start(chat: &str, pid: Option<u32>, provider: &str, model: Option<&str>) {
    println!(
        "{} {} chat={}, pid={}, provider={}, model={}",
        timestamp().dimmed(),
        "[SESSION]".blue().bold(),
        chat.cyan(),
        pid.map_or_else(|| "?".to_string(), |p| p.to_string()).dimmed(),
        provider.cyan(),
        model.unwrap_or("default").dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print that a chat's agent was stopped.
pub fn print_session_end(chat: &str) {
    println!(
        "{} {} chat={} stopped",
        timestamp().dimmed(),
        "[SESSION]".blue().bold(),
        chat.cyan()
    );
    let _ = io::stdout().flush();
}

/// Print the typing indicator shown while a prompt is in flight.
pub fn print_typing() {
    println!("{}", "[TYPING]".dimmed());
    let _ = io::stdout().flush();
}

/// Print a streamed text fragment without a newline.
pub fn print_text(text: &str) {
    print!("{text}");
    let _ = io::stdout().flush();
}

/// Print the agent's final reply.
pub fn print_reply(text: &str) {
    if text.is_empty() {
        println!("{} {}", "[AGENT]".green().bold(), "(no text)".dimmed());
    } else {
        println!("{} {}", "[AGENT]".green().bold(), text);
    }
    let _ = io::stdout().flush();
}

/// Print an informational line.
pub fn print_info(message: &str) {
    println!("{} {}", "[INFO]".cyan().bold(), message);
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "[ERROR]".red().bold(), message);
    let _ = io::stdout().flush();
}

/// Print an extension UI request and its options.
pub fn print_ui_request(request: &UiRequest, raw_mode: bool) {
    let title = request.title.as_deref().unwrap_or("Agent request");
    println!("{} {}", "[ASK]".yellow().bold(), title.bold());
    if let Some(message) = &request.message {
        println!("      {}", truncate(message, 400, raw_mode));
    }
    for (i, option) in request.options.iter().enumerate() {
        println!("      {}. {}", (i + 1).cyan(), format_option(option, raw_mode));
    }
    let _ = io::stdout().flush();
}

/// Print an input prompt without a newline.
pub fn print_ui_prompt(label: &str) {
    print!("{} ", label.yellow());
    let _ = io::stdout().flush();
}
