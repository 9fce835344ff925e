use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::sse::Event;
use crate::util::truncate_body;

/// Body chunks of a streaming response, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<Bytes, Error>>;

/// Decoded server-sent events.
pub type EventStream = BoxStream<'static, Result<Event, Error>>;

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Decode {
            endpoint: String::new(),
            message: source.to_string(),
            body: truncate_body(&self.body),
        })
    }
}

/// Response head plus a lazily read body, as returned by streaming transports.
pub struct StreamingResponse {
    status: StatusCode,
    headers: HeaderMap,
    chunks: ChunkStream,
}

impl StreamingResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, chunks: ChunkStream) -> Self {
        Self {
            status,
            headers,
            chunks,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_chunks(self) -> ChunkStream {
        self.chunks
    }

    /// Drains the remaining body; used to report non-success statuses.
    pub async fn collect(self) -> crate::Result<Response> {
        use futures_util::StreamExt;

        let Self {
            status,
            headers,
            mut chunks,
        } = self;
        let mut body = Vec::new();
        while let Some(chunk) = chunks.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(Response::new(status, headers, body))
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Status and headers of an event stream together with the events.
pub struct StreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    events: EventStream,
}

impl StreamResponse {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, events: EventStream) -> Self {
        Self {
            status,
            headers,
            events,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_events(self) -> EventStream {
        self.events
    }
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
