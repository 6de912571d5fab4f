//! Event-stream framing: splits a chunked body into `StreamFrame`s.

const DEFAULT_EVENT: &str = "message";

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamFrame {
    /// Value of the `event:` line, if any.
    pub event: Option<String>,
    /// All `data:` lines of the frame joined with `\n`.
    pub data: String,
    /// Value of the `id:` line, if any.
    pub id: Option<String>,
    /// Reconnect hint from a `retry:` line, in milliseconds.
    pub retry: Option<u64>,
}

impl StreamFrame {
    /// Event name, `"message"` when the frame carried no `event:` line.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT)
    }
}

/// Incremental frame decoder tolerant of arbitrary chunk boundaries.
///
/// Bytes are buffered rather than text so a multi-byte character split across
/// two chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk to the internal buffer.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) {
        self.buf.extend_from_slice(chunk.as_ref());
    }

    /// Returns every fully delimited frame in arrival order.
    ///
    /// A trailing segment without a delimiter stays buffered.
    pub fn drain(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    /// `feed` followed by `drain`.
    pub fn push_chunk(&mut self, chunk: impl AsRef<[u8]>) -> Vec<StreamFrame> {
        self.feed(chunk);
        self.drain()
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_frame(bytes: &[u8]) -> Option<StreamFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut frame = StreamFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        } else if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            frame.id = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            // non-numeric values are dropped, not an error
            if let Ok(ms) = rest.trim().parse::<u64>() {
                frame.retry = Some(ms);
            }
        }
    }
    frame.data = data_lines.join("\n");
    if frame.data.is_empty() {
        return None;
    }
    Some(frame)
}
