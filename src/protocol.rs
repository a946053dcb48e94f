//! incremental decoder for `data: ...` completion streams.
//!
//! a response body arrives as arbitrary-sized increments. each increment is
//! decoded to text and split on `\n`; only lines starting with `data: ` are
//! protocol events. the payload is either the `[DONE]` sentinel or a json
//! chunk whose `choices[0].delta.content` carries the next fragment.
//!
//! [`FramingMode::PerIncrement`] splits every increment on its own, so a line
//! torn across two increments is lost (its halves fail to parse or lack the
//! `data: ` prefix). [`FramingMode::Buffered`] keeps the unterminated tail of
//! an increment and prepends it to the next one.

use bevy::log::debug;
use serde::Deserialize;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";
/// longest unterminated tail kept between increments in buffered mode.
pub const MAX_CARRY_BYTES: usize = 1 << 20;

/// how line boundaries are handled across body increments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramingMode {
    /// split each increment independently; torn lines are dropped.
    #[default]
    PerIncrement,
    /// carry unterminated trailing bytes into the next increment.
    Buffered,
}

/// one decoded unit of the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    Delta(String),
    Done,
    /// a `data:` payload that was not valid chunk json; dropped by the client.
    Discarded(String),
}

#[derive(Deserialize)]
struct ChunkPayload {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// classify a single line. `None` for lines that carry no event: non-`data:`
/// lines, keep-alives, and chunks without a non-empty `choices[0].delta.content`.
pub fn parse_line(line: &str) -> Option<ProtocolEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let data = line.strip_prefix(DATA_PREFIX)?;
    if data == DONE_SENTINEL {
        return Some(ProtocolEvent::Done);
    }
    match serde_json::from_str::<ChunkPayload>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|text| !text.is_empty())
            .map(ProtocolEvent::Delta),
        Err(_) => Some(ProtocolEvent::Discarded(data.to_string())),
    }
}

/// stateful decoder for one response stream.
#[derive(Debug)]
pub struct StreamDecoder {
    mode: FramingMode,
    carry: Vec<u8>,
    max_carry: usize,
    finished: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(FramingMode::default())
    }
}

impl StreamDecoder {
    pub fn new(mode: FramingMode) -> Self {
        Self { mode, carry: Vec::new(), max_carry: MAX_CARRY_BYTES, finished: false }
    }

    /// cap the buffered tail; a longer unterminated run is dropped.
    pub fn with_max_carry(mut self, bytes: usize) -> Self {
        self.max_carry = bytes;
        self
    }

    /// true once `[DONE]` has been seen; nothing further is decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// decode one increment of the body.
    pub fn feed(&mut self, increment: &[u8]) -> Vec<ProtocolEvent> {
        if self.finished {
            return Vec::new();
        }
        match self.mode {
            FramingMode::PerIncrement => {
                let text = String::from_utf8_lossy(increment);
                self.decode_lines(&text)
            }
            FramingMode::Buffered => {
                self.carry.extend_from_slice(increment);
                let events = match self.carry.iter().rposition(|b| *b == b'\n') {
                    Some(end) => {
                        let rest = self.carry.split_off(end + 1);
                        let complete = std::mem::replace(&mut self.carry, rest);
                        let text = String::from_utf8_lossy(&complete);
                        self.decode_lines(&text)
                    }
                    None => Vec::new(),
                };
                if self.carry.len() > self.max_carry {
                    debug!(target: "bevy_chat_stream", "dropping {} unterminated bytes", self.carry.len());
                    self.carry.clear();
                }
                events
            }
        }
    }

    /// flush an unterminated tail at end of stream (buffered mode only).
    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        if self.finished || self.carry.is_empty() {
            return Vec::new();
        }
        let tail = std::mem::take(&mut self.carry);
        let text = String::from_utf8_lossy(&tail);
        self.decode_lines(&text)
    }

    fn decode_lines(&mut self, text: &str) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        for line in text.split('\n') {
            match parse_line(line) {
                Some(ProtocolEvent::Done) => {
                    self.finished = true;
                    self.carry.clear();
                    events.push(ProtocolEvent::Done);
                    break;
                }
                Some(ev) => events.push(ev),
                None => {}
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HI: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

    fn delta(s: &str) -> ProtocolEvent {
        ProtocolEvent::Delta(s.to_string())
    }

    #[test]
    fn parses_delta_and_done_lines() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"a"}}]}"#),
            Some(delta("a"))
        );
        assert_eq!(parse_line("data: [DONE]"), Some(ProtocolEvent::Done));
        assert_eq!(parse_line("data: [DONE]\r"), Some(ProtocolEvent::Done));
    }

    #[test]
    fn ignores_non_data_and_empty_content() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line(": keep-alive"), None);
        assert_eq!(parse_line("event: message"), None);
        assert_eq!(parse_line("data:[DONE]"), None);
        assert_eq!(parse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#), None);
        assert_eq!(parse_line(r#"data: {"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_line(r#"data: {"choices":[]}"#), None);
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#),
            None
        );
    }

    #[test]
    fn only_first_choice_is_read() {
        let line = r#"data: {"choices":[{"delta":{"content":"x"}},{"delta":{"content":"y"}}]}"#;
        assert_eq!(parse_line(line), Some(delta("x")));
    }

    #[test]
    fn malformed_json_is_discarded() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"del"#),
            Some(ProtocolEvent::Discarded(r#"{"choices":[{"del"#.to_string()))
        );
        assert!(matches!(parse_line(r#"data: {"object":"x"}"#), Some(ProtocolEvent::Discarded(_))));
    }

    #[test]
    fn single_increment_yields_fragment_then_done() {
        let mut dec = StreamDecoder::new(FramingMode::PerIncrement);
        assert_eq!(dec.feed(HI.as_bytes()), vec![delta("Hi"), ProtocolEvent::Done]);
        assert!(dec.is_finished());
        assert!(dec.feed(HI.as_bytes()).is_empty());
    }

    #[test]
    fn torn_line_is_lost_per_increment() {
        let split = HI.find("con").unwrap();
        let (a, b) = HI.split_at(split);
        let mut dec = StreamDecoder::new(FramingMode::PerIncrement);

        let first = dec.feed(a.as_bytes());
        assert!(first.iter().all(|e| matches!(e, ProtocolEvent::Discarded(_))));
        assert_eq!(dec.feed(b.as_bytes()), vec![ProtocolEvent::Done]);
    }

    #[test]
    fn torn_line_is_recovered_when_buffered() {
        let split = HI.find("con").unwrap();
        let (a, b) = HI.split_at(split);
        let mut dec = StreamDecoder::new(FramingMode::Buffered);

        assert!(dec.feed(a.as_bytes()).is_empty());
        assert_eq!(dec.feed(b.as_bytes()), vec![delta("Hi"), ProtocolEvent::Done]);
    }

    #[test]
    fn buffered_keeps_multibyte_chars_intact() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\n";
        let bytes = line.as_bytes();
        let cut = line.find('é').unwrap() + 1;
        let mut dec = StreamDecoder::new(FramingMode::Buffered);
        assert!(dec.feed(&bytes[..cut]).is_empty());
        assert_eq!(dec.feed(&bytes[cut..]), vec![delta("héllo")]);
    }

    #[test]
    fn buffered_finish_flushes_unterminated_tail() {
        let mut dec = StreamDecoder::new(FramingMode::Buffered);
        assert!(dec.feed(br#"data: {"choices":[{"delta":{"content":"end"}}]}"#).is_empty());
        assert_eq!(dec.finish(), vec![delta("end")]);
        assert!(dec.finish().is_empty());
    }

    #[test]
    fn oversized_tail_is_dropped_when_buffered() {
        let mut dec = StreamDecoder::new(FramingMode::Buffered).with_max_carry(16);
        assert!(dec.feed(b"data: {\"choices\":[{\"delta\":").is_empty());
        assert!(dec.feed(b"{\"content\":\"x\"}}]}").is_empty());
        // the rest of the long line is now headless and no longer decodes
        let events = dec.feed(b"\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n");
        assert_eq!(events, vec![delta("ok")]);
        assert!(dec.finish().is_empty());
    }

    #[test]
    fn lines_after_done_in_same_increment_are_ignored() {
        let body = "data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n";
        let mut dec = StreamDecoder::new(FramingMode::PerIncrement);
        assert_eq!(dec.feed(body.as_bytes()), vec![ProtocolEvent::Done]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut body = b"data: {\"choices\":[{\"delta\":{\"content\":\"a".to_vec();
        body.push(0xff);
        body.extend_from_slice(b"\"}}]}\n");
        let mut dec = StreamDecoder::new(FramingMode::PerIncrement);
        assert_eq!(dec.feed(&body), vec![delta("a\u{fffd}")]);
    }
}
