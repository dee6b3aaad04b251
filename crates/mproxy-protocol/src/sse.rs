//! Server-sent-events framing for upstream response streams.
//!
//! The reader buffers raw bytes and cuts on blank-line frame boundaries, so
//! chunk splits anywhere (mid-line, even mid-UTF-8) are safe; field parsing
//! only ever sees a complete frame.

/// One complete SSE frame: the optional event name and the joined data lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Comment-only and empty frames carry nothing worth forwarding.
    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }
}

/// Incremental frame reader over an SSE byte stream.
#[derive(Debug, Default)]
pub struct SseFrameReader {
    pending: Vec<u8>,
}

impl SseFrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((frame_len, consumed)) = frame_boundary(&self.pending) {
            let raw: Vec<u8> = self.pending.drain(..consumed).take(frame_len).collect();
            if let Some(frame) = parse_frame(&raw)
                && !frame.is_empty()
            {
                frames.push(frame);
            }
        }
        frames
    }

    /// End of stream: whatever is buffered is treated as a final frame even
    /// without its terminating blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        parse_frame(&raw).filter(|frame| !frame.is_empty())
    }
}

/// Finds the first blank-line boundary. Returns the frame length and the
/// total bytes to consume (frame plus delimiter). Both `\n\n` and CRLF
/// variants terminate a frame.
fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0usize;
    let mut i = 0usize;
    while i < buffer.len() {
        if buffer[i] != b'\n' {
            i += 1;
            continue;
        }
        let line = &buffer[line_start..i];
        let blank = line.is_empty() || line == b"\r";
        if blank && line_start > 0 {
            return Some((line_start, i + 1));
        }
        i += 1;
        line_start = i;
    }
    None
}

/// Parses one complete frame's field lines. Comments (`:` prefix) are
/// dropped; repeated `data` fields join with a newline; a later `event`
/// field wins.
fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = (!value.is_empty()).then(|| value.to_string()),
            "data" => match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            // id/retry and unknown fields are irrelevant to proxying.
            _ => {}
        }
    }

    Some(SseFrame {
        event,
        data: data.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_anywhere_across_chunks() {
        let mut reader = SseFrameReader::new();
        assert!(reader.push(b"data: {\"a\":").is_empty());
        let frames = reader.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn chunk_split_inside_utf8_is_safe() {
        let payload = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let cut = payload.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut reader = SseFrameReader::new();
        assert!(reader.push(&payload[..cut]).is_empty());
        let frames = reader.push(&payload[cut..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn named_events_and_comments() {
        let mut reader = SseFrameReader::new();
        let frames = reader.push(b": ping\nevent: message_start\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut reader = SseFrameReader::new();
        let frames = reader.push(b"data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn crlf_delimiters_are_honored() {
        let mut reader = SseFrameReader::new();
        let frames = reader.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "one");
        assert_eq!(frames[1].data, "two");
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut reader = SseFrameReader::new();
        assert!(reader.push(b"data: tail").is_empty());
        let frame = reader.finish().expect("tail frame");
        assert_eq!(frame.data, "tail");
        assert!(reader.finish().is_none());
    }

    #[test]
    fn comment_only_tail_is_dropped() {
        let mut reader = SseFrameReader::new();
        assert!(reader.push(b": keepalive").is_empty());
        assert!(reader.finish().is_none());
    }
}
