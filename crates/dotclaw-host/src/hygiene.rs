//! Turn hygiene: normalize, sanitize and deduplicate a message batch before
//! it reaches the agent.
//!
//! Chat adapters deliver noisy streams — editor placeholders, double sends,
//! progressively re-sent drafts, and raw tool envelopes. One pass here
//! leaves a clean, ordered turn. The whole pass is idempotent: applying it
//! to its own output changes nothing.

use std::sync::LazyLock;

use regex::Regex;

use dotclaw_store::NewMessage;

/// Dedup window per sender.
const DEDUP_WINDOW_MS: i64 = 60_000;
/// A previous message must be at least this long to count as a prefix chunk.
const PREFIX_MIN_LEN: usize = 24;
/// And at least this share of the successor's length.
const PREFIX_MIN_RATIO: f64 = 0.35;
/// Cap on a normalized tool-result summary.
const TOOL_SUMMARY_MAX: usize = 1_200;

/// Editor/streaming placeholders that stand in for a message being typed.
static STALE_PARTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\[\(]?(typing|streaming|partial|draft|working|thinking)[\)\]]?(\.{2,}|…+)?$|^\.{2,}$|^…+$",
    )
    .unwrap()
});

static TOOL_XML_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^<tool_result(?:\s+name="([^"]*)")?\s*>(.*)</tool_result>$"#).unwrap()
});

/// Run the full hygiene pass over one incoming batch (already in cursor
/// order). Malformed messages are dropped; survivors come back sanitized
/// and deduplicated.
pub fn apply_turn_hygiene(batch: Vec<NewMessage>) -> Vec<NewMessage> {
    let mut kept: Vec<NewMessage> = Vec::with_capacity(batch.len());

    for mut msg in batch {
        if !is_well_formed(&msg) {
            continue;
        }
        msg.body = sanitize_body(&msg.body);
        if let Some(normalized) = normalize_tool_envelope(&msg.body) {
            msg.body = normalized;
        }

        // Compare against the last kept message from the same sender inside
        // the window.
        let prev_idx = kept.iter().rposition(|p| {
            p.sender_id == msg.sender_id && (msg.ts - p.ts).abs() <= DEDUP_WINDOW_MS
        });
        if let Some(idx) = prev_idx {
            let prev = &kept[idx];
            // A placeholder followed by real content is stale — drop it.
            if is_stale_partial(&prev.body) && !is_stale_partial(&msg.body) {
                kept.remove(idx);
                kept.push(msg);
                continue;
            }
            // Exact duplicate of the previous message.
            if dedup_key(&prev.body) == dedup_key(&msg.body) {
                continue;
            }
            // Progressive re-send: the previous message is a prefix chunk of
            // this one — keep only the longer.
            if is_prefix_chunk(&prev.body, &msg.body) {
                kept.remove(idx);
                kept.push(msg);
                continue;
            }
        }
        kept.push(msg);
    }
    kept
}

fn is_well_formed(msg: &NewMessage) -> bool {
    !msg.msg_id.is_empty() && !msg.chat_id.is_empty() && !msg.sender_id.is_empty() && msg.ts > 0
}

/// Strip control bytes (keeping tab/LF/CR), normalize CRLF, trim trailing
/// spaces before newlines, trim the whole body.
pub fn sanitize_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for ch in body.chars() {
        if ch.is_control() && ch != '\t' && ch != '\n' && ch != '\r' {
            continue;
        }
        out.push(ch);
    }
    let out = out.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = out.split('\n').map(|l| l.trim_end_matches(' ')).collect();
    // Rejoin, then trim outer whitespace.
    let joined = {
        let mut s = String::with_capacity(out.len());
        for (i, line) in lines.drain(..).enumerate() {
            if i > 0 {
                s.push('\n');
            }
            s.push_str(line);
        }
        s
    };
    joined.trim().to_string()
}

fn is_stale_partial(body: &str) -> bool {
    STALE_PARTIAL_RE.is_match(body.trim())
}

fn dedup_key(body: &str) -> String {
    body.trim().to_lowercase()
}

fn is_prefix_chunk(prev: &str, cur: &str) -> bool {
    prev.len() >= PREFIX_MIN_LEN
        && cur.len() > prev.len()
        && cur.starts_with(prev)
        && (prev.len() as f64) / (cur.len() as f64) >= PREFIX_MIN_RATIO
}

/// Normalize a raw tool envelope into `"Tool result[ (<name>)]: <summary>"`.
///
/// Accepts the XML form `<tool_result name="...">…</tool_result>` and the
/// JSON forms `{"tool_result": {...}}` / `{"tool"|"tool_name"|"name": ...,
/// "output"|"result"|"message"|"data": ...}`. Returns `None` for anything
/// that is not a tool envelope.
pub fn normalize_tool_envelope(body: &str) -> Option<String> {
    let trimmed = body.trim();

    if let Some(caps) = TOOL_XML_RE.captures(trimmed) {
        let name = caps.get(1).map(|m| m.as_str().to_string());
        let inner = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        return Some(render_tool_result(name.as_deref(), inner));
    }

    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;

    let inner = match obj.get("tool_result") {
        Some(serde_json::Value::Object(inner)) => inner,
        Some(other) => {
            return Some(render_tool_result(None, &value_to_text(other)));
        }
        None => obj,
    };

    let name = ["tool", "tool_name", "name"]
        .iter()
        .find_map(|k| inner.get(*k))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let output = ["output", "result", "message", "data"]
        .iter()
        .find_map(|k| inner.get(*k))
        .map(value_to_text);

    // A bare object with neither a name nor an output is not an envelope.
    match (name, output) {
        (None, None) => None,
        (name, output) => Some(render_tool_result(
            name.as_deref(),
            output.as_deref().unwrap_or(""),
        )),
    }
}

fn render_tool_result(name: Option<&str>, summary: &str) -> String {
    let summary = truncate(summary.trim(), TOOL_SUMMARY_MAX);
    match name {
        Some(name) if !name.is_empty() => format!("Tool result ({name}): {summary}"),
        _ => format!("Tool result: {summary}"),
    }
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, sender: &str, ts: i64, body: &str) -> NewMessage {
        NewMessage {
            msg_id: id.to_string(),
            chat_id: "c1".to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            body: body.to_string(),
            ts,
            from_self: false,
        }
    }

    #[test]
    fn sanitize_strips_control_and_normalizes_newlines() {
        assert_eq!(sanitize_body("a\u{0007}b\r\nc  \nd\u{200B}"), "ab\nc\nd\u{200B}");
        assert_eq!(sanitize_body("  hello \t there  "), "hello \t there");
        assert_eq!(sanitize_body("line one   \nline two"), "line one\nline two");
    }

    #[test]
    fn malformed_messages_are_rejected() {
        let out = apply_turn_hygiene(vec![
            msg("", "u1", 1000, "no id"),
            msg("2", "u1", 0, "bad ts"),
            msg("3", "u1", 1000, "fine"),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_id, "3");
    }

    #[test]
    fn stale_partial_dropped_when_real_message_follows() {
        let out = apply_turn_hygiene(vec![
            msg("1", "u1", 1000, "typing…"),
            msg("2", "u1", 2000, "here is my actual question"),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_id, "2");

        // Placeholders from different senders are untouched.
        let out = apply_turn_hygiene(vec![
            msg("1", "u1", 1000, "[thinking]"),
            msg("2", "u2", 2000, "unrelated"),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn exact_duplicates_within_window_collapse() {
        let out = apply_turn_hygiene(vec![
            msg("1", "u1", 1000, "Deploy it"),
            msg("2", "u1", 1500, "deploy it"),
            // Outside the 60s window — kept.
            msg("3", "u1", 70_000, "deploy it"),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].msg_id, "1");
        assert_eq!(out[1].msg_id, "3");
    }

    #[test]
    fn prefix_chunks_are_replaced_by_the_longer_message() {
        let prefix = "The quick brown fox jumps";
        let full = "The quick brown fox jumps over the lazy dog";
        let out = apply_turn_hygiene(vec![
            msg("1", "u1", 1000, prefix),
            msg("2", "u1", 2000, full),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, full);

        // A short prefix is just a separate message.
        let out = apply_turn_hygiene(vec![
            msg("1", "u1", 1000, "ok"),
            msg("2", "u1", 2000, "ok here is the full plan for today"),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn hygiene_is_idempotent() {
        let batch = vec![
            msg("1", "u1", 1000, "typing…"),
            msg("2", "u1", 1200, "The quick brown fox jumps"),
            msg("3", "u1", 1400, "The quick brown fox jumps over the lazy dog"),
            msg("4", "u1", 1500, "the quick brown fox jumps over the lazy dog"),
            msg("5", "u2", 1600, "something\r\nelse  \n"),
        ];
        let once = apply_turn_hygiene(batch);
        let twice = apply_turn_hygiene(once.clone());
        let ids = |v: &[NewMessage]| v.iter().map(|m| m.msg_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&once), ids(&twice));
        assert_eq!(
            once.iter().map(|m| &m.body).collect::<Vec<_>>(),
            twice.iter().map(|m| &m.body).collect::<Vec<_>>()
        );
    }

    #[test]
    fn xml_tool_envelope_normalizes() {
        let body = r#"<tool_result name="bash">exit 0
stdout: done</tool_result>"#;
        assert_eq!(
            normalize_tool_envelope(body).unwrap(),
            "Tool result (bash): exit 0\nstdout: done"
        );
        let body = "<tool_result>plain payload</tool_result>";
        assert_eq!(
            normalize_tool_envelope(body).unwrap(),
            "Tool result: plain payload"
        );
    }

    #[test]
    fn json_tool_envelopes_normalize() {
        let body = r#"{"tool_result": {"tool": "web_search", "output": "3 hits"}}"#;
        assert_eq!(
            normalize_tool_envelope(body).unwrap(),
            "Tool result (web_search): 3 hits"
        );
        let body = r#"{"tool_name": "files", "result": {"count": 2}}"#;
        assert_eq!(
            normalize_tool_envelope(body).unwrap(),
            r#"Tool result (files): {"count":2}"#
        );
        assert!(normalize_tool_envelope("just a { brace").is_none());
        assert!(normalize_tool_envelope(r#"{"unrelated": true}"#).is_none());
    }

    #[test]
    fn tool_summary_truncates_at_cap() {
        let long = "x".repeat(5000);
        let body = format!(r#"{{"tool": "bash", "output": "{long}"}}"#);
        let normalized = normalize_tool_envelope(&body).unwrap();
        assert!(normalized.len() <= "Tool result (bash): ".len() + TOOL_SUMMARY_MAX);
    }
}
