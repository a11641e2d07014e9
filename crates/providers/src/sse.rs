//! Server-sent-event frame parsing.
//!
//! A response body is a sequence of newline-terminated lines (LF or CRLF).
//! `data: ` lines accumulate; a blank line closes the frame and emits the
//! accumulated payload joined with `\n`. Network chunks may split lines or
//! UTF-8 sequences anywhere, so undecoded bytes are buffered until a newline
//! arrives.
//!
//! In [`Mode::Strict`] (the proxied streaming protocol) any other non-empty
//! line is a protocol error. Frames completed before a bad line are still
//! returned; the error comes from the next call. [`Mode::Lenient`] accepts the full SSE field set
//! (`event:`, `id:`, `retry:`, `:` comments) for backends that send them.

use kestrel_core::ProviderError;

/// One complete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the last `event:` field (lenient mode only).
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    /// Parse the payload as JSON. A bad payload is a protocol error.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProviderError> {
        serde_json::from_str(&self.data).map_err(|e| {
            ProviderError::Protocol(format!("invalid JSON in stream frame: {e}: {}", self.data))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Strict,
    Lenient,
}

#[derive(Debug)]
pub struct FrameParser {
    mode: Mode,
    pending: Vec<u8>,
    data_lines: Vec<String>,
    event: Option<String>,
    failed: Option<ProviderError>,
}

impl FrameParser {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            data_lines: Vec::new(),
            event: None,
            failed: None,
        }
    }

    pub fn strict() -> Self {
        Self::new(Mode::Strict)
    }

    pub fn lenient() -> Self {
        Self::new(Mode::Lenient)
    }

    /// Feed a network chunk; returns every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProviderError> {
        if let Some(e) = self.failed.take() {
            return Err(e);
        }
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            match decode_line(&raw[..raw.len() - 1]).and_then(|line| self.line(&line)) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => {
                    self.pending.clear();
                    if frames.is_empty() {
                        return Err(e);
                    }
                    self.failed = Some(e);
                    break;
                }
            }
        }
        Ok(frames)
    }

    /// End of body. A trailing unterminated line is processed and any
    /// accumulated data is flushed as a final frame.
    pub fn finish(&mut self) -> Result<Option<Frame>, ProviderError> {
        if let Some(e) = self.failed.take() {
            return Err(e);
        }
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = decode_line(&raw)?;
            if let Some(frame) = self.line(&line)? {
                return Ok(Some(frame));
            }
        }
        Ok(self.flush())
    }

    fn line(&mut self, line: &str) -> Result<Option<Frame>, ProviderError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Ok(self.flush());
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim().to_string());
            return Ok(None);
        }
        match self.mode {
            Mode::Strict => Err(ProviderError::Protocol(format!(
                "unexpected line in stream: {line:?}"
            ))),
            Mode::Lenient => {
                if let Some(event) = line.strip_prefix("event:") {
                    self.event = Some(event.trim().to_string());
                }
                Ok(None)
            }
        }
    }

    fn flush(&mut self) -> Option<Frame> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(Frame {
            event: self.event.take(),
            data,
        })
    }
}

fn decode_line(raw: &[u8]) -> Result<String, ProviderError> {
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProviderError::Protocol(format!("stream line is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn all_frames(parser: &mut FrameParser, chunks: &[&[u8]]) -> Vec<Frame> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(parser.feed(chunk).unwrap());
        }
        out.extend(parser.finish().unwrap());
        out
    }

    #[test]
    fn two_records_in_order() {
        let mut parser = FrameParser::strict();
        let frames = all_frames(&mut parser, &[b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n"]);
        let values: Vec<Value> = frames.iter().map(|f| f.json().unwrap()).collect();
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut parser = FrameParser::strict();
        let frames = all_frames(&mut parser, &[b"data: {\"a\":\ndata: 1}\n\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].json::<Value>().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn crlf_and_split_chunks() {
        let mut parser = FrameParser::strict();
        let frames = all_frames(&mut parser, &[b"da", b"ta: {\"x\":", b"true}\r", b"\n\r\n"]);
        assert_eq!(frames[0].json::<Value>().unwrap(), json!({"x": true}));
    }

    #[test]
    fn utf8_split_across_chunks() {
        let text = "data: {\"s\":\"héllo\"}\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut parser = FrameParser::strict();
        let frames = all_frames(&mut parser, &[&text[..split], &text[split..]]);
        assert_eq!(frames[0].json::<Value>().unwrap()["s"], "héllo");
    }

    #[test]
    fn blank_lines_without_data_are_ignored() {
        let mut parser = FrameParser::strict();
        let frames = all_frames(&mut parser, &[b"\n\n\ndata: 1\n\n\n"]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn strict_mode_rejects_unknown_lines() {
        let mut parser = FrameParser::strict();
        let err = parser.feed(b"event: ping\n").unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
    }

    #[test]
    fn frames_before_bad_line_are_kept() {
        let mut parser = FrameParser::strict();
        let frames = parser.feed(b"data: {\"a\":1}\n\nnot sse\ndata: {\"b\":2}\n\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].json::<Value>().unwrap(), json!({"a": 1}));
        assert!(matches!(parser.finish(), Err(ProviderError::Protocol(_))));
    }

    #[test]
    fn lenient_mode_tracks_event_names() {
        let mut parser = FrameParser::lenient();
        let frames = all_frames(
            &mut parser,
            &[b": keepalive\nevent: message_start\ndata: {}\n\ndata: [DONE]\n\n"],
        );
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[1].event, None);
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn residual_data_flushed_at_end() {
        let mut parser = FrameParser::strict();
        let frames = all_frames(&mut parser, &[b"data: {\"tail\":1}"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].json::<Value>().unwrap(), json!({"tail": 1}));
    }

    #[test]
    fn bad_json_is_protocol_error() {
        let frame = Frame { event: None, data: "{nope".into() };
        assert!(matches!(frame.json::<Value>(), Err(ProviderError::Protocol(_))));
    }
}
