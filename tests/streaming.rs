mod support;

use std::sync::Arc;

use futures_util::TryStreamExt;
use pristine::prelude::{CallOptions, Client, Endpoint, Error, ErrorCategory, Event, Outcome};
use pristine::sse::EventDispatcher;
use serde_json::{Value, json};

use support::{MockTransport, Step, fast_retry, header};

const BASE_URL: &str = "https://stream.example.test";

const FEED: &str = "id: 1\nevent: delta\ndata: {\"text\":\"he\"}\n\n\
: keepalive\n\n\
id: 2\r\nevent: delta\r\ndata: {\"text\":\"llo\"}\r\n\r\n\
data: line one\rdata: line two\r\r\
event: done\ndata: [DONE]\n\n";

fn streaming_client(transport: &Arc<MockTransport>) -> Client {
    Client::builder(BASE_URL)
        .transport(transport.clone())
        .streaming_transport(transport.clone())
        .retry_policy(fast_retry(3))
        .try_build()
        .expect("build client")
}

fn completions() -> Endpoint {
    Endpoint::post("completions.stream", "/v1/completions").streaming(true)
}

fn expected_events() -> Vec<Event> {
    vec![
        Event::new(r#"{"text":"he"}"#).with_id("1").with_event("delta"),
        Event::new(r#"{"text":"llo"}"#).with_id("2").with_event("delta"),
        Event::new("line one\nline two"),
        Event::new("[DONE]").with_event("done"),
    ]
}

#[tokio::test]
async fn events_survive_any_chunking() {
    for chunk_size in [1, 2, 3, 7, 64, FEED.len()] {
        let transport = MockTransport::sequence(vec![
            Step::status(200)
                .header("content-type", "text/event-stream")
                .body(FEED)
                .chunk_size(chunk_size),
        ]);
        let client = streaming_client(&transport);

        let response = client
            .execute_stream(&completions(), &json!({ "prompt": "hi" }), CallOptions::new())
            .await
            .expect("stream opens");
        assert_eq!(response.status().as_u16(), 200);
        let events: Vec<Event> = response
            .into_events()
            .try_collect()
            .await
            .expect("stream decodes");

        assert_eq!(events, expected_events(), "chunk size {chunk_size}");
        let delta: Value = events[1].json().expect("delta is JSON");
        assert_eq!(delta["text"], "llo");
    }
}

#[tokio::test]
async fn streaming_requests_ask_for_an_event_stream() {
    let transport = MockTransport::sequence(vec![Step::status(200).body("data: x\n\n")]);
    let client = streaming_client(&transport);

    client
        .execute_stream(&completions(), &json!({}), CallOptions::new())
        .await
        .expect("stream opens");

    assert_eq!(
        header(&transport.requests()[0], "accept"),
        Some("text/event-stream")
    );
}

#[tokio::test]
async fn failed_opens_are_retried_before_any_event() {
    let transport = MockTransport::sequence(vec![
        Step::status(503).body("warming up"),
        Step::status(200).body("data: ready\n\n"),
    ]);
    let client = streaming_client(&transport);

    let events: Vec<Event> = client
        .execute_stream(&completions(), &json!({}), CallOptions::new())
        .await
        .expect("second open succeeds")
        .into_events()
        .try_collect()
        .await
        .expect("stream decodes");

    assert_eq!(events, vec![Event::new("ready")]);
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn rejected_open_carries_the_error_body() {
    let transport = MockTransport::sequence(vec![
        Step::status(401).body(r#"{"error":"invalid key"}"#),
    ]);
    let client = streaming_client(&transport);

    let error = client
        .execute_stream(&completions(), &json!({}), CallOptions::new())
        .await
        .expect_err("unauthorized");

    assert_eq!(error.category(), ErrorCategory::Authentication);
    match error {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(status, 401);
            assert!(body.contains("invalid key"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn streaming_without_a_streaming_transport_is_a_configuration_error() {
    let transport = MockTransport::sequence(vec![Step::status(200)]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .try_build()
        .expect("build client");

    let error = client
        .execute_stream(&completions(), &json!({}), CallOptions::new())
        .await
        .expect_err("no streaming transport");

    assert!(matches!(error, Error::MissingTransport { kind: "streaming" }));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn dispatcher_routes_streamed_events_by_type() {
    let transport = MockTransport::sequence(vec![Step::status(200).body(FEED).chunk_size(5)]);
    let client = streaming_client(&transport);

    let outcome = client
        .invoke(&completions(), &json!({}), CallOptions::new())
        .await
        .expect("stream opens");
    let Outcome::Stream(response) = outcome else {
        panic!("expected a stream, got {outcome:?}");
    };

    let mut text = String::new();
    let mut finished = false;
    let mut other = 0;
    let handled = EventDispatcher::new()
        .on("delta", |event| {
            if let Ok(delta) = event.json::<Value>()
                && let Some(piece) = delta["text"].as_str()
            {
                text.push_str(piece);
            }
        })
        .on("done", |_| finished = true)
        .fallback(|_| other += 1)
        .run(response.into_events())
        .await
        .expect("stream decodes");

    assert_eq!(handled, 4);
    assert_eq!(text, "hello");
    assert!(finished);
    assert_eq!(other, 1);
}
