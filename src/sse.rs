//! Server-sent event framing shared by every streaming upstream.
//!
//! Frames end at the earliest double newline in any of the accepted spellings
//! (`\n\n`, `\r\r`, `\r\n\n`, `\n\r\n`, `\r\n\r\n`). Inside a frame, lines are
//! split on bare `\r` or `\n` and classified by their field prefix. Multiple
//! `data:` lines are joined with `\n`.

use std::fmt::Display;

use futures_util::{stream::BoxStream, Stream, StreamExt};
use thiserror::Error;

const FIELD_ID: &[u8] = b"id:";
const FIELD_DATA: &[u8] = b"data:";
const FIELD_EVENT: &[u8] = b"event:";
const FIELD_RETRY: &[u8] = b"retry:";

/// Longest delimiters first so that `\r\n\r\n` wins over its prefixes.
const DELIMITERS: [&[u8]; 5] = [b"\r\n\r\n", b"\r\n\n", b"\n\r\n", b"\r\r", b"\n\n"];
const LONGEST_DELIMITER: usize = 4;

/// Largest undelimited frame the decoder holds before giving up.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

pub type EventStream = BoxStream<'static, Result<Event, SseError>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<String>,
}

impl Event {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SseError {
    #[error("event stream read failed: {0}")]
    Read(String),
    #[error("event frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Incremental frame splitter. Holds undelimited bytes between feeds.
#[derive(Debug)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }
}

impl EventDecoder {
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame,
        }
    }

    /// Appends complete events to `events`. Fails once the undelimited tail
    /// grows past the frame limit; events completed before that are kept.
    pub fn feed(&mut self, bytes: &[u8], events: &mut Vec<Event>) -> Result<(), SseError> {
        // The held tail had no delimiter, so only its last bytes can start one.
        let mut search_from = self.buffer.len().saturating_sub(LONGEST_DELIMITER - 1);
        self.buffer.extend_from_slice(bytes);

        let mut consumed = 0;
        while let Some((start, len)) = find_delimiter(&self.buffer[search_from..]) {
            let end = search_from + start;
            if let Some(event) = parse_frame(&self.buffer[consumed..end]) {
                events.push(event);
            }
            consumed = end + len;
            search_from = consumed;
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_frame {
            self.buffer.clear();
            return Err(SseError::FrameTooLarge { limit: self.max_frame });
        }
        Ok(())
    }

    /// Flushes a trailing frame the source closed without delimiting.
    pub fn finish(&mut self) -> Option<Event> {
        let frame = std::mem::take(&mut self.buffer);
        parse_frame(&frame)
    }
}

/// Wraps a byte stream into a lazy event sequence. A fresh decoder is used for
/// every call; the sequence ends when the source closes.
pub fn decode_stream<S, B, E>(source: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let mut source = Box::pin(source);
    let stream = async_stream::stream! {
        let mut decoder = EventDecoder::default();
        let mut failed = false;

        while let Some(next) = source.next().await {
            match next {
                Ok(bytes) => {
                    let mut events = Vec::new();
                    let fed = decoder.feed(bytes.as_ref(), &mut events);
                    for event in events {
                        yield Ok(event);
                    }
                    if let Err(error) = fed {
                        yield Err(error);
                        failed = true;
                        break;
                    }
                }
                Err(error) => {
                    yield Err(SseError::Read(error.to_string()));
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            if let Some(event) = decoder.finish() {
                yield Ok(event);
            }
        }
    };
    stream.boxed()
}

fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|index| {
        DELIMITERS
            .iter()
            .find(|delimiter| buffer[index..].starts_with(delimiter))
            .map(|delimiter| (index, delimiter.len()))
    })
}

/// Returns `None` for frames without any recognized field, such as
/// comment-only keep-alives.
fn parse_frame(frame: &[u8]) -> Option<Event> {
    let lines = frame
        .split(|byte| *byte == b'\n' || *byte == b'\r')
        .filter(|line| !line.is_empty());

    let mut event = Event::default();
    let mut data = Vec::new();
    let mut recognized = false;
    for line in lines {
        if let Some(value) = line.strip_prefix(FIELD_ID) {
            event.id = Some(field_text(value));
        } else if let Some(value) = line.strip_prefix(FIELD_DATA) {
            data.extend_from_slice(strip_leading_space(value));
            data.push(b'\n');
        } else if line == b"data" {
            data.push(b'\n');
        } else if let Some(value) = line.strip_prefix(FIELD_EVENT) {
            event.event = Some(field_text(value));
        } else if let Some(value) = line.strip_prefix(FIELD_RETRY) {
            event.retry = Some(field_text(value));
        } else {
            continue;
        }
        recognized = true;
    }
    if !recognized {
        return None;
    }

    if data.last() == Some(&b'\n') {
        data.pop();
    }
    event.data = String::from_utf8_lossy(&data).into_owned();
    Some(event)
}

fn strip_leading_space(value: &[u8]) -> &[u8] {
    value.strip_prefix(b" ").unwrap_or(value)
}

fn field_text(value: &[u8]) -> String {
    String::from_utf8_lossy(strip_leading_space(value)).into_owned()
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures_util::{stream, StreamExt};

    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<Event> {
        let mut decoder = EventDecoder::default();
        let mut events = Vec::new();
        for chunk in chunks {
            decoder.feed(chunk, &mut events).expect("frame within limit");
        }
        events.extend(decoder.finish());
        events
    }

    fn data_event(data: &str) -> Event {
        Event {
            data: data.to_owned(),
            ..Event::default()
        }
    }

    #[test]
    fn joins_multiline_data_fields() {
        let events = decode_all(&[b"data: foo\ndata: bar\n\n"]);
        assert_eq!(events, vec![data_event("foo\nbar")]);
    }

    #[test]
    fn reads_every_field_and_ignores_unknown_lines() {
        let events = decode_all(&[
            b": keep-alive\nid: 7\nevent: message\nretry: 3000\nfoo: bar\ndata:{\"a\":1}\n\n",
        ]);
        assert_eq!(
            events,
            vec![Event {
                id: Some("7".to_owned()),
                event: Some("message".to_owned()),
                data: "{\"a\":1}".to_owned(),
                retry: Some("3000".to_owned()),
            }]
        );
    }

    #[test]
    fn strips_only_one_leading_space() {
        let events = decode_all(&[b"data:  indented\n\n"]);
        assert_eq!(events[0].data, " indented");
    }

    #[test]
    fn accepts_every_double_newline_spelling() {
        let events = decode_all(&[
            b"data: a\r\rdata: b\r\n\ndata: c\n\r\ndata: d\r\n\r\ndata: e\n\n",
        ]);
        let data = events.into_iter().map(|event| event.data).collect::<Vec<_>>();
        assert_eq!(data, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn bare_data_line_contributes_an_empty_line() {
        let events = decode_all(&[b"data: top\ndata\ndata: bottom\n\n"]);
        assert_eq!(events[0].data, "top\n\nbottom");
    }

    #[test]
    fn flushes_an_undelimited_tail_at_end_of_input() {
        let events = decode_all(&[b"data: one\n\ndata: two"]);
        assert_eq!(events, vec![data_event("one"), data_event("two")]);
    }

    #[test]
    fn skips_empty_frames() {
        let events = decode_all(&[b"\n\n\n\ndata: x\n\n\r\n\r\n"]);
        assert_eq!(events, vec![data_event("x")]);
    }

    #[test]
    fn output_does_not_depend_on_chunk_boundaries() {
        let wire: &[u8] = "event: message\r\ndata: {\"content\":\"héllo\"}\r\n\r\n\
id: 2\ndata: first\ndata: second\n\n\
data: crcr\r\r\
: comment\ndata: last\n\r\n\
data: [DONE]\n\n"
            .as_bytes();
        let whole = decode_all(&[wire]);
        assert_eq!(whole.len(), 5);

        for split in 0..=wire.len() {
            let (left, right) = wire.split_at(split);
            assert_eq!(decode_all(&[left, right]), whole, "split at {split}");
        }

        let bytewise = wire.chunks(1).collect::<Vec<_>>();
        assert_eq!(decode_all(&bytewise), whole);
    }

    #[tokio::test]
    async fn stream_ends_cleanly_when_source_closes() {
        let source = stream::iter(vec![
            Ok::<_, Infallible>(b"data: he".to_vec()),
            Ok(b"llo\n\ndata: [DONE]\n\n".to_vec()),
        ]);
        let events = decode_stream(source).collect::<Vec<_>>().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(data_event("hello")));
        assert!(events[1].as_ref().is_ok_and(Event::is_done_marker));
    }

    #[tokio::test]
    async fn stream_surfaces_read_errors_and_stops() {
        let source = stream::iter(vec![
            Ok(b"data: partial\n\n".to_vec()),
            Err("connection reset"),
            Ok(b"data: never\n\n".to_vec()),
        ]);
        let events = decode_stream(source).collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                Ok(data_event("partial")),
                Err(SseError::Read("connection reset".to_owned())),
            ]
        );
    }

    #[test]
    fn comment_only_frames_produce_no_event() {
        let events = decode_all(&[b": keep-alive\n\n", b":ping\r\nx-unknown: 1\r\n\r\n", b"data: real\n\n"]);
        assert_eq!(events, vec![data_event("real")]);
    }

    #[test]
    fn oversized_frame_is_rejected_but_earlier_events_survive() {
        let mut decoder = EventDecoder::with_max_frame(16);
        let mut events = Vec::new();

        decoder
            .feed(b"data: ok\n\ndata: 0123456789", &mut events)
            .expect("tail within limit");
        let error = decoder
            .feed(b"abcdefghij", &mut events)
            .expect_err("tail over limit");

        assert_eq!(events, vec![data_event("ok")]);
        assert_eq!(error, SseError::FrameTooLarge { limit: 16 });
    }

    #[test]
    fn large_frame_in_small_reads_still_decodes() {
        let payload = "x".repeat(64 * 1024);
        let wire = format!("data: {payload}\r\n\r\ndata: tail\n\n");
        let chunks = wire.as_bytes().chunks(7).collect::<Vec<_>>();

        let events = decode_all(&chunks);
        assert_eq!(events, vec![data_event(&payload), data_event("tail")]);
    }

    #[tokio::test]
    async fn stream_stops_with_an_error_on_an_oversized_frame() {
        let huge = vec![b'y'; MAX_FRAME_BYTES + 1];
        let source = stream::iter(vec![
            Ok::<_, Infallible>(b"data: first\n\ndata: ".to_vec()),
            Ok(huge),
            Ok(b"\n\ndata: never\n\n".to_vec()),
        ]);
        let events = decode_stream(source).collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                Ok(data_event("first")),
                Err(SseError::FrameTooLarge { limit: MAX_FRAME_BYTES }),
            ]
        );
    }
}
