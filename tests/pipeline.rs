mod support;

use std::panic::panic_any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pristine::prelude::{
    ApiKeyAuth, BearerAuth, CallOptions, CircuitBreakerPolicy, Client, Endpoint, Error,
    ErrorCategory, Outcome, RetryPolicy,
};
use pristine::{CodecContext, RateLimitPolicy, Serializer, events};
use serde::Deserialize;
use serde_json::{Value, json};

use support::{MockTransport, RecordingSink, Step, fast_retry, header};

const BASE_URL: &str = "https://api.example.test";

fn client_with(transport: &Arc<MockTransport>, retry: RetryPolicy) -> Client {
    Client::builder(BASE_URL)
        .transport(transport.clone())
        .streaming_transport(transport.clone())
        .retry_policy(retry)
        .metrics(true)
        .try_build()
        .expect("build client")
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    id: String,
}

#[tokio::test]
async fn successful_call_decodes_typed_response() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({ "id": "item-1" }))]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::post("items.create", "/v1/items").response_type("Item");

    let item: Item = client
        .execute(&endpoint, &json!({ "name": "demo" }), CallOptions::new())
        .await
        .expect("call succeeds");

    assert_eq!(item, Item { id: "item-1".to_owned() });
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url(), "https://api.example.test/v1/items");
    assert_eq!(header(&requests[0], "content-type"), Some("application/json"));
    assert_eq!(requests[0].body(), &Bytes::from_static(br#"{"name":"demo"}"#));
}

#[tokio::test]
async fn idempotency_key_is_stable_across_retries_and_fresh_per_call() {
    let transport = MockTransport::sequence(vec![
        Step::status(503),
        Step::status(503),
        Step::json(200, json!({})),
        Step::json(200, json!({})),
    ]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::post("charges.create", "/v1/charges").idempotent(true);

    client
        .execute_value(&endpoint, &json!({ "amount": 5 }), CallOptions::new())
        .await
        .expect("third attempt succeeds");
    client
        .execute_value(&endpoint, &json!({ "amount": 5 }), CallOptions::new())
        .await
        .expect("second call succeeds");

    let keys: Vec<String> = transport
        .requests()
        .iter()
        .map(|request| header(request, "idempotency-key").expect("key sent").to_owned())
        .collect();
    assert_eq!(keys.len(), 4);
    assert_eq!(keys[0], keys[1]);
    assert_eq!(keys[1], keys[2]);
    assert_ne!(keys[2], keys[3]);
}

#[tokio::test]
async fn caller_supplied_idempotency_key_is_sent_verbatim() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = client_with(&transport, fast_retry(1));
    let endpoint = Endpoint::post("charges.create", "/v1/charges").idempotent(true);

    client
        .execute_value(
            &endpoint,
            &json!({}),
            CallOptions::new().idempotency_key("charge-001"),
        )
        .await
        .expect("call succeeds");

    assert_eq!(
        header(&transport.requests()[0], "idempotency-key"),
        Some("charge-001")
    );
}

#[tokio::test]
async fn non_idempotent_endpoints_send_no_key() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = client_with(&transport, fast_retry(1));
    let endpoint = Endpoint::get("items.list", "/v1/items");

    client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect("call succeeds");

    let request = &transport.requests()[0];
    assert_eq!(header(request, "idempotency-key"), None);
    assert!(request.body().is_empty());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let transport = MockTransport::sequence(vec![
        Step::json(400, json!({ "error": "bad field" })),
        Step::json(200, json!({})),
    ]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::post("items.create", "/v1/items");

    let error = client
        .execute_value(&endpoint, &json!({}), CallOptions::new())
        .await
        .expect_err("400 is final");

    assert_eq!(error.category(), ErrorCategory::Validation);
    assert_eq!(error.status().map(|status| status.as_u16()), Some(400));
    match &error {
        Error::HttpStatus { body, .. } => assert!(body.contains("bad field")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let transport = MockTransport::sequence(vec![
        Step::status(500),
        Step::status(502),
        Step::json(200, json!({ "ok": true })),
    ]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::get("health", "/health");

    let value = client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect("third attempt succeeds");

    assert_eq!(value, json!({ "ok": true }));
    assert_eq!(transport.request_count(), 3);
    let snapshot = client.metrics_snapshot().expect("metrics enabled");
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.requests_succeeded, 1);
    assert_eq!(snapshot.status_counts.get(&200), Some(&1));
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_status() {
    let transport = MockTransport::sequence(vec![Step::status(503)]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::get("health", "/health");

    let error = client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect_err("all attempts fail");

    assert_eq!(error.category(), ErrorCategory::ServerError);
    assert_eq!(transport.request_count(), 3);
    let snapshot = client.metrics_snapshot().expect("metrics enabled");
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.error_counts.get("server_error"), Some(&1));
}

#[tokio::test]
async fn connection_errors_are_retried() {
    let transport = MockTransport::sequence(vec![Step::refused(), Step::json(200, json!({}))]);
    let client = client_with(&transport, fast_retry(2));
    let endpoint = Endpoint::get("health", "/health");

    client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect("second attempt succeeds");
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn retry_after_on_429_delays_the_next_attempt() {
    let sink = RecordingSink::new();
    let transport = MockTransport::sequence(vec![
        Step::status(429).header("retry-after", "1"),
        Step::json(200, json!({})),
    ]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(fast_retry(2))
        .rate_limit_policy(RateLimitPolicy::standard().max_backoff(Duration::from_secs(2)))
        .telemetry(sink.clone())
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::get("items.list", "/v1/items");

    let started = Instant::now();
    client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect("retry succeeds");

    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(transport.request_count(), 2);
    let backoffs = sink.named(events::RATE_LIMIT_BACKOFF);
    assert_eq!(backoffs.len(), 1);
    assert_eq!(backoffs[0].0.get("delay_ms"), Some(&1000.0));
    let retries = sink.named(events::REQUEST_RETRY);
    assert_eq!(retries[0].0.get("delay_ms"), Some(&1000.0));
}

#[tokio::test]
async fn attempt_timeout_maps_to_timeout_error() {
    let transport = MockTransport::sequence(vec![
        Step::json(200, json!({})).delay(Duration::from_millis(300)),
    ]);
    let client = client_with(&transport, RetryPolicy::disabled());
    let endpoint = Endpoint::get("slow", "/slow");

    let error = client
        .execute_value(
            &endpoint,
            &Value::Null,
            CallOptions::new().timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("attempt times out");

    assert!(matches!(error, Error::Timeout { timeout_ms: 20, .. }));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn decode_failures_are_not_retried() {
    let transport = MockTransport::sequence(vec![Step::status(200).body("not json")]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::get("items.list", "/v1/items").response_type("ItemList");

    let error = client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect_err("body is not JSON");

    match &error {
        Error::Decode { endpoint, message, .. } => {
            assert_eq!(endpoint, "items.list");
            assert!(message.contains("ItemList"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn typed_decode_failure_is_reported_as_a_failed_call() {
    let sink = RecordingSink::new();
    let transport = MockTransport::sequence(vec![Step::json(200, json!({ "wrong": 1 }))]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .telemetry(sink.clone())
        .metrics(true)
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::get("items.get", "/v1/items/1").response_type("Item");

    let error = client
        .execute::<_, Item>(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect_err("body does not match Item");

    assert_eq!(error.category(), ErrorCategory::Validation);
    assert_eq!(transport.request_count(), 1);
    assert!(sink.named(events::REQUEST_STOP).is_empty());
    let exceptions = sink.named(events::REQUEST_EXCEPTION);
    assert_eq!(exceptions.len(), 1);
    assert_eq!(
        exceptions[0].1.get("category").map(String::as_str),
        Some("validation")
    );
    let snapshot = client.metrics_snapshot().expect("metrics enabled");
    assert_eq!(snapshot.requests_succeeded, 0);
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.error_counts.get("validation"), Some(&1));
}

#[tokio::test]
async fn throttling_on_one_endpoint_pauses_the_whole_destination() {
    let transport = MockTransport::sequence(vec![
        Step::status(429).header("retry-after", "1"),
        Step::json(200, json!({ "ok": true })),
    ]);
    let client = client_with(&transport, RetryPolicy::disabled());

    let error = client
        .execute_value(
            &Endpoint::post("items.create", "/v1/items"),
            &json!({}),
            CallOptions::new(),
        )
        .await
        .expect_err("throttled");
    assert_eq!(error.category(), ErrorCategory::RateLimit);

    let started = Instant::now();
    let value = client
        .execute_value(&Endpoint::get("users.list", "/v1/users"), &Value::Null, CallOptions::new())
        .await
        .expect("second endpoint succeeds after the pause");

    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(value, json!({ "ok": true }));
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn open_circuit_rejects_without_reaching_the_transport() {
    let transport = MockTransport::sequence(vec![Step::status(500)]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(RetryPolicy::disabled())
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(2)
                .reset_timeout(Duration::from_secs(60)),
        )
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::get("flaky", "/flaky");

    for _ in 0..2 {
        let error = client
            .execute_value(&endpoint, &Value::Null, CallOptions::new())
            .await
            .expect_err("server error");
        assert_eq!(error.category(), ErrorCategory::ServerError);
    }
    let error = client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect_err("circuit is open");

    assert_eq!(error.category(), ErrorCategory::CircuitOpen);
    assert!(error.retry_after().is_some());
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn throttling_does_not_open_the_circuit() {
    let transport = MockTransport::sequence(vec![Step::status(429).header("retry-after", "0")]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(RetryPolicy::disabled())
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(1))
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::get("busy", "/busy");

    for _ in 0..3 {
        let error = client
            .execute_value(&endpoint, &Value::Null, CallOptions::new())
            .await
            .expect_err("throttled");
        assert_eq!(error.category(), ErrorCategory::RateLimit);
    }
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn named_policies_apply_per_endpoint() {
    let transport = MockTransport::sequence(vec![
        Step::status(503),
        Step::status(503),
        Step::status(503),
        Step::json(200, json!({})),
    ]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(RetryPolicy::disabled())
        .retry_policy_named("patient", fast_retry(5))
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::get("reports.fetch", "/v1/reports").retry_policy("patient");

    client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect("named policy retries");
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn unknown_policy_name_fails_before_sending() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = client_with(&transport, fast_retry(3));
    let endpoint = Endpoint::get("reports.fetch", "/v1/reports").retry_policy("missing");

    let error = client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect_err("unknown policy");

    assert!(matches!(error, Error::UnknownPolicy { ref name, .. } if name == "missing"));
    assert_eq!(error.category(), ErrorCategory::Configuration);
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn path_query_and_header_layers_are_merged() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .try_default_header("x-client", "pristine-tests")
        .expect("valid header")
        .try_default_header("x-layer", "client")
        .expect("valid header")
        .auth(Arc::new(BearerAuth::new("secret-token").expect("valid token")))
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::get("items.get", "/v1/items/{item_id}")
        .query("expand", "owner")
        .header("x-layer", "endpoint");

    client
        .execute_value(
            &endpoint,
            &Value::Null,
            CallOptions::new()
                .path_param("item_id", "a b")
                .query_pair("page", "2")
                .try_header("x-layer", "call")
                .expect("valid header"),
        )
        .await
        .expect("call succeeds");

    let request = &transport.requests()[0];
    assert_eq!(
        request.url(),
        "https://api.example.test/v1/items/a%20b?expand=owner&page=2"
    );
    assert_eq!(header(request, "x-client"), Some("pristine-tests"));
    assert_eq!(header(request, "x-layer"), Some("call"));
    assert_eq!(header(request, "authorization"), Some("Bearer secret-token"));
}

#[tokio::test]
async fn later_auth_providers_override_earlier_ones() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .auth(Arc::new(ApiKeyAuth::new("x-api-key", "first").expect("valid key")))
        .auth(Arc::new(ApiKeyAuth::new("x-api-key", "second").expect("valid key")))
        .try_build()
        .expect("build client");

    client
        .execute_value(&Endpoint::get("me", "/v1/me"), &Value::Null, CallOptions::new())
        .await
        .expect("call succeeds");

    assert_eq!(header(&transport.requests()[0], "x-api-key"), Some("second"));
}

#[tokio::test]
async fn missing_path_param_is_reported() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = client_with(&transport, fast_retry(1));
    let endpoint = Endpoint::get("items.get", "/v1/items/{item_id}");

    let error = client
        .execute_value(&endpoint, &Value::Null, CallOptions::new())
        .await
        .expect_err("item_id missing");

    assert!(matches!(error, Error::MissingPathParam { ref name, .. } if name == "item_id"));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn byte_budget_serializes_bodies_larger_than_the_budget() {
    let transport = MockTransport::sequence(vec![
        Step::json(200, json!({})).delay(Duration::from_millis(50)),
    ]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .max_in_flight_bytes(4)
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::post("uploads.create", "/v1/uploads");
    let payload = json!({ "data": "0123456789" });

    let calls = (0..3).map(|_| client.execute_value(&endpoint, &payload, CallOptions::new()));
    for result in futures_util::future::join_all(calls).await {
        result.expect("upload succeeds");
    }

    assert_eq!(transport.request_count(), 3);
    assert_eq!(transport.max_active(), 1);
    let budget = client.byte_budget().expect("budget configured");
    assert_eq!(budget.available(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_timeout_fails_the_queued_call() {
    let transport = MockTransport::sequence(vec![
        Step::json(200, json!({})).delay(Duration::from_millis(300)),
    ]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(RetryPolicy::disabled())
        .max_in_flight_bytes(4)
        .try_build()
        .expect("build client");
    let endpoint = Endpoint::post("uploads.create", "/v1/uploads");
    let payload = json!({ "data": "0123456789" });

    let holder = {
        let client = client.clone();
        let endpoint = endpoint.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            client
                .execute_value(&endpoint, &payload, CallOptions::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let error = client
        .execute_value(
            &endpoint,
            &payload,
            CallOptions::new().budget_timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("budget stays overdrawn");
    assert_eq!(error.category(), ErrorCategory::BudgetTimeout);

    holder
        .await
        .expect("holder task joins")
        .expect("holder succeeds");
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn invoke_returns_a_value_for_plain_endpoints() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({ "n": 1 }))]);
    let client = client_with(&transport, fast_retry(1));

    let outcome = client
        .invoke(&Endpoint::get("count", "/count"), &Value::Null, CallOptions::new())
        .await
        .expect("call succeeds");

    assert!(matches!(outcome, Outcome::Value(ref value) if value == &json!({ "n": 1 })));
}

#[tokio::test]
async fn request_telemetry_reports_attempts_and_status() {
    let sink = RecordingSink::new();
    let transport = MockTransport::sequence(vec![Step::status(500), Step::json(201, json!({}))]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(fast_retry(2))
        .telemetry(sink.clone())
        .try_build()
        .expect("build client");

    client
        .execute_value(
            &Endpoint::post("items.create", "/v1/items"),
            &json!({}),
            CallOptions::new(),
        )
        .await
        .expect("retry succeeds");

    assert_eq!(sink.named(events::REQUEST_START).len(), 1);
    let stops = sink.named(events::REQUEST_STOP);
    assert_eq!(stops.len(), 1);
    let (measurements, metadata) = &stops[0];
    assert_eq!(measurements.get("attempts"), Some(&2.0));
    assert!(measurements.contains_key("duration_ms"));
    assert_eq!(metadata.get("status").map(String::as_str), Some("201"));
    assert_eq!(metadata.get("endpoint").map(String::as_str), Some("items.create"));
}

struct PanickingSerializer;

impl Serializer for PanickingSerializer {
    fn encode(&self, _value: &Value, _context: CodecContext<'_>) -> pristine::Result<Bytes> {
        panic_any("encoder exploded")
    }

    fn decode(&self, _body: &[u8], _context: CodecContext<'_>) -> pristine::Result<Value> {
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn serializer_panics_become_internal_errors() {
    let transport = MockTransport::sequence(vec![Step::json(200, json!({}))]);
    let client = Client::builder(BASE_URL)
        .transport(transport.clone())
        .serializer(Arc::new(PanickingSerializer))
        .try_build()
        .expect("build client");

    let error = client
        .execute_value(
            &Endpoint::post("items.create", "/v1/items"),
            &json!({ "name": "demo" }),
            CallOptions::new(),
        )
        .await
        .expect_err("encoder panics");

    assert_eq!(error.category(), ErrorCategory::Internal);
    assert!(error.to_string().contains("encoder exploded"));
    assert_eq!(transport.request_count(), 0);
}
