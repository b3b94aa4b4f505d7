use serde::{Deserialize, Serialize};

/// One parsed SSE frame as seen by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

/// Drain complete frames (terminated by a blank line) from `buffer`,
/// leaving any partial frame in place. Comment lines are dropped.
pub fn parse_frames(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();
    while let Some(pos) = find_frame_end(buffer) {
        let frame = buffer[..pos.body].to_string();
        buffer.drain(..pos.end);
        let mut event = SseEvent::default();
        let mut data_lines: Vec<&str> = Vec::new();
        let mut saw_field = false;
        for line in frame.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => {
                    event.id = Some(value.to_string());
                    saw_field = true;
                }
                "event" => {
                    event.event = Some(value.to_string());
                    saw_field = true;
                }
                "retry" => {
                    event.retry = value.parse().ok();
                    saw_field = true;
                }
                "data" => {
                    data_lines.push(value);
                    saw_field = true;
                }
                _ => {}
            }
        }
        if saw_field {
            event.data = data_lines.join("\n");
            events.push(event);
        }
    }
    events
}

struct FrameEnd {
    /// Bytes of frame body, excluding the terminator.
    body: usize,
    /// Bytes to drain including the terminator.
    end: usize,
}

fn find_frame_end(buffer: &str) -> Option<FrameEnd> {
    let lf = buffer.find("\n\n").map(|p| FrameEnd { body: p, end: p + 2 });
    let crlf = buffer
        .find("\r\n\r\n")
        .map(|p| FrameEnd { body: p, end: p + 4 });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.body <= b.body { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
