//! Prompt assembly and outbound cleanup.

use crate::model::{ChatMessage, format_timestamp};

/// Escape the five XML special characters.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Render conversation history as a `<messages>` block. Empty input gives "".
pub fn format_history(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut out = String::from("<messages>\n");
    for m in messages {
        let role = if m.is_bot_message { "assistant" } else { "user" };
        out.push_str(&format!(
            "  <message role=\"{role}\" sender=\"{}\" timestamp=\"{}\">\n    {}\n  </message>\n",
            escape_xml(&m.sender_name),
            format_timestamp(&m.timestamp),
            escape_xml(&m.content),
        ));
    }
    out.push_str("</messages>");
    out
}

/// History followed by an optional standing instruction.
pub fn build_prompt(history: &[ChatMessage], instruction: Option<&str>) -> String {
    let block = format_history(history);
    match instruction {
        Some(instruction) if block.is_empty() => instruction.to_string(),
        Some(instruction) => format!("{block}\n\n<task>\n{}\n</task>", escape_xml(instruction)),
        None => block,
    }
}

/// Clean up raw agent output before it is stored and shown.
pub fn format_outbound(raw: &str) -> String {
    raw.trim().to_string()
}

/// Shorten text for log lines, respecting char boundaries.
pub fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape_xml(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &apos;Jerry&apos;&lt;/a&gt;"
        );
    }

    #[test]
    fn history_block_marks_roles() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let messages = vec![
            ChatMessage::inbound("c", "alice", "@Andy hi <3", ts),
            ChatMessage::from_assistant("c", "Andy", "hello", ts),
        ];
        let block = format_history(&messages);
        assert!(block.starts_with("<messages>\n"));
        assert!(block.ends_with("</messages>"));
        assert!(block.contains(
            r#"<message role="user" sender="alice" timestamp="2024-06-01T12:00:00.000000Z">"#
        ));
        assert!(block.contains("@Andy hi &lt;3"));
        assert!(block.contains(r#"role="assistant" sender="Andy""#));
    }

    #[test]
    fn empty_history_is_empty() {
        assert_eq!(format_history(&[]), "");
        assert_eq!(build_prompt(&[], Some("summarize")), "summarize");
    }

    #[test]
    fn instruction_follows_history() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let messages = vec![ChatMessage::inbound("c", "alice", "hi", ts)];
        let prompt = build_prompt(&messages, Some("daily digest"));
        assert!(prompt.starts_with("<messages>"));
        assert!(prompt.ends_with("<task>\ndaily digest\n</task>"));
    }

    #[test]
    fn outbound_is_trimmed() {
        assert_eq!(format_outbound("  hi there \n"), "hi there");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("hello", 10), "hello");
        assert_eq!(preview("héllo world", 2), "h...");
    }
}
