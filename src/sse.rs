//! Incremental `text/event-stream` decoding.
//!
//! [`Decoder::feed`] accepts arbitrary chunk boundaries, down to one byte at a
//! time, and returns every event closed by a blank line. Blocks may be
//! terminated by `\n\n`, `\r\n\r\n` or `\r\r`; whatever follows the last
//! terminator stays buffered until more bytes arrive.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::{StreamExt, stream};
use serde::de::DeserializeOwned;
use tracing::debug;

const TERMINATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];
const MAX_TERMINATOR_LEN: usize = 4;

/// Event type reported for blocks without an `event` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// The `event` field, or `"message"` when absent.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }

    /// Wire form: `event:`, `id:`, `retry:` then one `data:` line per data
    /// line, closed by a blank line.
    pub fn to_wire(&self) -> String {
        let mut wire = String::new();
        if let Some(event) = &self.event {
            let _ = writeln!(wire, "event: {event}");
        }
        if let Some(id) = &self.id {
            let _ = writeln!(wire, "id: {id}");
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(wire, "retry: {retry}");
        }
        let has_other_fields = self.event.is_some() || self.id.is_some() || self.retry.is_some();
        if !self.data.is_empty() || !has_other_fields {
            for line in self.data.split('\n') {
                let _ = writeln!(wire, "data: {line}");
            }
        }
        wire.push('\n');
        wire
    }
}

/// Buffer of bytes that do not yet form a complete block.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for a terminator.
    scanned: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `chunk` and drains every complete block, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        // A terminator may straddle the previous scan boundary.
        let mut from = self.scanned.saturating_sub(MAX_TERMINATOR_LEN - 1);
        while let Some((end, terminator_len)) = find_terminator(&self.buffer, from) {
            let block = self.buffer.split_to(end + terminator_len).freeze();
            if let Some(event) = parse_block(&block[..end]) {
                events.push(event);
            }
            from = 0;
        }
        self.scanned = self.buffer.len();
        events
    }

    /// Drops any unterminated remainder and returns how many bytes it held.
    pub fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        discarded
    }
}

/// Earliest terminator at or after `from`, as (block end, terminator length).
fn find_terminator(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = buffer.get(from..)?;
    TERMINATORS
        .iter()
        .filter_map(|terminator| {
            tail.windows(terminator.len())
                .position(|window| window == *terminator)
                .map(|index| (from + index, terminator.len()))
        })
        .min_by_key(|(index, _)| *index)
}

fn parse_block(block: &[u8]) -> Option<Event> {
    let text = String::from_utf8_lossy(block);
    let mut event = Event::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut recognized = false;

    for line in split_lines(&text) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                data_lines.push(value);
                recognized = true;
            }
            "event" => {
                event.event = Some(value.to_owned());
                recognized = true;
            }
            "id" => {
                event.id = Some(value.to_owned());
                recognized = true;
            }
            "retry" => {
                if let Ok(retry) = value.parse::<u64>() {
                    event.retry = Some(retry);
                    recognized = true;
                }
            }
            _ => {}
        }
    }

    if !recognized {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.find(['\r', '\n']) {
            Some(index) => {
                let line = &rest[..index];
                let skip = if rest[index..].starts_with("\r\n") { 2 } else { 1 };
                rest = &rest[index + skip..];
                Some(line)
            }
            None => {
                let line = rest;
                rest = "";
                Some(line)
            }
        }
    })
}

struct StreamState<S> {
    chunks: S,
    decoder: Decoder,
    ready: VecDeque<Event>,
    finished: bool,
}

/// Lazily decodes events from a chunk stream. A chunk error is yielded once
/// and ends the stream; an unterminated tail at end of input is discarded.
pub fn decode_stream<S, B, E>(chunks: S) -> impl Stream<Item = Result<Event, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let state = StreamState {
        chunks: Box::pin(chunks),
        decoder: Decoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.decoder.feed(chunk.as_ref())),
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    let discarded = state.decoder.reset();
                    if discarded > 0 {
                        debug!(discarded, "event stream ended inside an unterminated block");
                    }
                }
            }
        }
    })
}

/// Blocking counterpart of [`decode_stream`] for in-memory chunk sources.
pub fn decode_iter<I, B>(chunks: I) -> impl Iterator<Item = Event>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut chunks = chunks.into_iter();
    let mut decoder = Decoder::new();
    let mut ready = VecDeque::new();
    std::iter::from_fn(move || {
        loop {
            if let Some(event) = ready.pop_front() {
                return Some(event);
            }
            let chunk = chunks.next()?;
            ready.extend(decoder.feed(chunk.as_ref()));
        }
    })
}

type Handler<'a> = Box<dyn FnMut(&Event) + Send + 'a>;

/// Routes events to handlers by event type, with an optional catch-all.
#[derive(Default)]
pub struct EventDispatcher<'a> {
    handlers: BTreeMap<String, Handler<'a>>,
    fallback: Option<Handler<'a>>,
}

impl<'a> EventDispatcher<'a> {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            fallback: None,
        }
    }

    pub fn on(
        mut self,
        event_type: impl Into<String>,
        handler: impl FnMut(&Event) + Send + 'a,
    ) -> Self {
        self.handlers.insert(event_type.into(), Box::new(handler));
        self
    }

    pub fn fallback(mut self, handler: impl FnMut(&Event) + Send + 'a) -> Self {
        self.fallback = Some(Box::new(handler));
        self
    }

    /// Returns whether any handler accepted the event.
    pub fn dispatch(&mut self, event: &Event) -> bool {
        if let Some(handler) = self.handlers.get_mut(event.event_type()) {
            handler(event);
            return true;
        }
        match &mut self.fallback {
            Some(fallback) => {
                fallback(event);
                true
            }
            None => false,
        }
    }

    /// Dispatches every event of `events` and returns how many were handled.
    pub async fn run<S, E>(&mut self, events: S) -> Result<usize, E>
    where
        S: Stream<Item = Result<Event, E>>,
    {
        let mut events = Box::pin(events);
        let mut handled = 0;
        while let Some(event) = events.next().await {
            if self.dispatch(&event?) {
                handled += 1;
            }
        }
        Ok(handled)
    }
}

impl std::fmt::Debug for EventDispatcher<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EventDispatcher")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Splits a byte payload into fixed-size chunks, mainly for feeding tests.
pub fn chunked(payload: &[u8], size: usize) -> Vec<Bytes> {
    payload
        .chunks(size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}
