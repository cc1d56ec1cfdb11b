//! Wire protocol of the streaming chat endpoint.
//!
//! The body is a sequence of event frames separated by a blank line. Every
//! frame holds one or more `data:` lines whose payload is either the literal
//! `[DONE]` or a JSON object carrying one of `interaccionId`, `error` or
//! `chunk`. Anything else is ignored.

use serde::Deserialize;
use serde_json::Value;

/// Marker the tutor appends once the student has solved the exercise.
pub const FINISH_TOKEN: &str = "<FIN_EJERCICIO>";
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    InteractionId(String),
    Error(String),
    Chunk(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default, rename = "interaccionId", alias = "interactionId")]
    interaction_id: Option<Value>,
    #[serde(default)]
    chunk: Option<Value>,
}

/// Parses the payload of one `data:` line (prefix already removed).
pub fn parse_data(raw: &str) -> Option<Frame> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s == DONE_SENTINEL {
        return Some(Frame::Done);
    }
    let payload: Payload = serde_json::from_str(s).ok()?;

    if let Some(error) = payload.error.and_then(truthy_text) {
        return Some(Frame::Error(error));
    }
    if let Some(id) = payload.interaction_id.and_then(truthy_text) {
        return Some(Frame::InteractionId(id));
    }
    match payload.chunk {
        Some(Value::String(chunk)) if !chunk.is_empty() => Some(Frame::Chunk(chunk)),
        _ => None,
    }
}

pub fn parse_data_line(line: &str) -> Option<Frame> {
    let rest = line.strip_prefix("data:")?;
    parse_data(rest.trim_start())
}

fn truthy_text(v: Value) -> Option<String> {
    match v {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn parse_event(event: &str) -> impl Iterator<Item = Frame> + '_ {
    event
        .split('\n')
        .filter(|line| !line.is_empty())
        .filter_map(parse_data_line)
}

/// Incremental decoder: feed it network reads in order, get back every frame
/// whose terminating blank line has been seen. Incomplete UTF-8 sequences and
/// incomplete frames are carried over to the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending_bytes: Vec<u8>,
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.pending_bytes.extend_from_slice(bytes);
        self.decode_pending();
        self.drain_complete()
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.pending_bytes.is_empty() {
            let rest = std::mem::take(&mut self.pending_bytes);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
            self.normalize_newlines();
        }
        let mut frames = self.drain_complete();
        let tail = std::mem::take(&mut self.buffer);
        frames.extend(parse_event(&tail));
        frames
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(s) => {
                    self.buffer.push_str(s);
                    self.pending_bytes.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(std::str::from_utf8(&self.pending_bytes[..valid]).unwrap_or_default());
                    match e.error_len() {
                        None => {
                            self.pending_bytes.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        self.normalize_newlines();
    }

    fn normalize_newlines(&mut self) {
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
    }

    fn drain_complete(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..pos + 2).collect();
            frames.extend(parse_event(&event[..pos]));
        }
        frames
    }
}

pub fn contains_finish_token(text: &str) -> bool {
    text.contains(FINISH_TOKEN)
}

/// Removes every occurrence of the finish token, including ones that only
/// appear after an inner occurrence has been removed.
pub fn strip_finish_token(text: &str) -> String {
    let mut out = text.replace(FINISH_TOKEN, "");
    while out.contains(FINISH_TOKEN) {
        out = out.replace(FINISH_TOKEN, "");
    }
    out
}

fn partial_token_suffix(text: &str) -> usize {
    (1..FINISH_TOKEN.len())
        .rev()
        .find(|&n| text.ends_with(&FINISH_TOKEN[..n]))
        .unwrap_or(0)
}

/// Text shown for the raw accumulated reply. While the stream is still open a
/// trailing prefix of the finish token is held back, it may be completed by
/// the next chunk.
pub fn display_text(raw: &str, streaming: bool) -> String {
    let mut text = strip_finish_token(raw);
    if streaming {
        let hidden = partial_token_suffix(&text);
        text.truncate(text.len() - hidden);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(frames: &[Frame]) -> String {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Chunk(c) => Some(c.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn frames_split_mid_frame_are_reassembled() {
        let body = b"data: {\"chunk\":\"He\"}\n\ndata: {\"chunk\":\"llo\"}\n\n";
        for split in 1..body.len() {
            let mut dec = FrameDecoder::new();
            let mut frames = dec.push(&body[..split]);
            frames.extend(dec.push(&body[split..]));
            frames.extend(dec.finish());
            assert_eq!(chunks(&frames), "Hello", "split at {}", split);
            assert_eq!(frames.len(), 2);
        }
    }

    #[test]
    fn nothing_is_emitted_before_the_blank_line() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: {\"chunk\":\"a\"}\n").is_empty());
        assert_eq!(dec.buffered(), "data: {\"chunk\":\"a\"}\n");
        assert_eq!(dec.push(b"\n"), vec![Frame::Chunk("a".into())]);
        assert_eq!(dec.buffered(), "");
    }

    #[test]
    fn one_frame_may_carry_several_data_lines() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b"event: message\ndata: {\"interaccionId\":\"abc123\"}\ndata: {\"chunk\":\"x\"}\n: comment\n\n");
        assert_eq!(frames, vec![Frame::InteractionId("abc123".into()), Frame::Chunk("x".into())]);
    }

    #[test]
    fn crlf_separators_are_accepted_even_when_split() {
        let mut dec = FrameDecoder::new();
        let mut frames = dec.push(b"data: {\"chunk\":\"a\"}\r");
        frames.extend(dec.push(b"\n\r\ndata: [DONE]\r\n\r\n"));
        assert_eq!(frames, vec![Frame::Chunk("a".into()), Frame::Done]);
    }

    #[test]
    fn multibyte_characters_split_across_reads() {
        let body = "data: {\"chunk\":\"¿qué?\"}\n\n".as_bytes();
        let cut = body.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = FrameDecoder::new();
        let mut frames = dec.push(&body[..cut]);
        frames.extend(dec.push(&body[cut..]));
        assert_eq!(frames, vec![Frame::Chunk("¿qué?".into())]);
    }

    #[test]
    fn unterminated_tail_is_flushed_on_finish() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: {\"chunk\":\"end\"}").is_empty());
        assert_eq!(dec.finish(), vec![Frame::Chunk("end".into())]);
    }

    #[test]
    fn payload_classification() {
        assert_eq!(parse_data("[DONE]"), Some(Frame::Done));
        assert_eq!(parse_data(" [DONE] "), Some(Frame::Done));
        assert_eq!(parse_data(r#"{"interactionId":"i9"}"#), Some(Frame::InteractionId("i9".into())));
        assert_eq!(parse_data(r#"{"interaccionId":17}"#), Some(Frame::InteractionId("17".into())));
        assert_eq!(parse_data(r#"{"error":"model down","chunk":"x"}"#), Some(Frame::Error("model down".into())));
        assert_eq!(parse_data(r#"{"chunk":""}"#), None);
        assert_eq!(parse_data(r#"{"chunk":5}"#), None);
        assert_eq!(parse_data(r#"{"error":null,"chunk":"ok"}"#), Some(Frame::Chunk("ok".into())));
        assert_eq!(parse_data("{not json"), None);
        assert_eq!(parse_data("42"), None);
        assert_eq!(parse_data(""), None);
        assert_eq!(parse_data_line("id: 3"), None);
        assert_eq!(parse_data_line("data:{\"chunk\":\"tight\"}"), Some(Frame::Chunk("tight".into())));
    }

    #[test]
    fn strip_is_idempotent() {
        let samples = [
            "plain",
            "done <FIN_EJERCICIO>",
            "<FIN_EJERCICIO>a<FIN_EJERCICIO>b",
            "<FIN_<FIN_EJERCICIO>EJERCICIO>",
        ];
        for s in samples {
            let once = strip_finish_token(s);
            assert!(!contains_finish_token(&once));
            assert_eq!(strip_finish_token(&once), once);
        }
        assert_eq!(strip_finish_token("<FIN_<FIN_EJERCICIO>EJERCICIO>"), "");
    }

    #[test]
    fn partial_token_is_hidden_only_while_streaming() {
        let raw = "Well done <FIN_EJ";
        assert_eq!(display_text(raw, true), "Well done ");
        assert_eq!(display_text(raw, false), raw);
        assert_eq!(display_text("Well done <FIN_EJERCICIO>", true), "Well done ");
        assert_eq!(display_text("a < b", true), "a < b");
        assert_eq!(display_text("ends with <", true), "ends with ");
    }

    #[test]
    fn displayed_text_equals_stripped_concatenation() {
        let pieces = ["Bien", " hecho ", "<FIN_", "EJERCICIO", ">", " fin"];
        let mut raw = String::new();
        for p in pieces {
            raw.push_str(p);
            let shown = display_text(&raw, true);
            assert!(strip_finish_token(&raw).starts_with(&shown));
        }
        assert_eq!(display_text(&raw, false), strip_finish_token(&pieces.concat()));
        assert_eq!(display_text(&raw, false), "Bien hecho  fin");
        assert!(contains_finish_token(&raw));
    }
}
