use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use mproxy_common::IpLimitPolicy;
use mproxy_core::{
    ClientResponse, Engine, EngineConfig, EventHub, InboundRequest, RequestError, RouteOp,
    UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamResponseBody,
};
use mproxy_pool::{Credential, CredentialPool, CredentialSeed};
use mproxy_protocol::ApiFormat;
use mproxy_registry::{ModelFamily, Service};
use mproxy_users::{MemoryPersistence, UserPatch, UserStore};

/// Scripted upstream: pops one canned response per request and records what
/// was sent.
#[derive(Default)]
struct FakeUpstream {
    script: Mutex<VecDeque<CannedResponse>>,
    requests: Mutex<Vec<UpstreamHttpRequest>>,
}

enum CannedResponse {
    Json { status: u16, body: serde_json::Value },
    Stream { status: u16, frames: Vec<&'static str> },
}

impl FakeUpstream {
    fn push_json(&self, status: u16, body: serde_json::Value) {
        self.script
            .lock()
            .unwrap()
            .push_back(CannedResponse::Json { status, body });
    }

    fn push_stream(&self, status: u16, frames: Vec<&'static str>) {
        self.script
            .lock()
            .unwrap()
            .push_back(CannedResponse::Stream { status, frames });
    }

    fn sent(&self) -> Vec<UpstreamHttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for FakeUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.requests.lock().unwrap().push(req);
        let canned = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match canned.expect("fake upstream script exhausted") {
                CannedResponse::Json { status, body } => Ok(UpstreamHttpResponse {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: UpstreamResponseBody::Bytes(Bytes::from(body.to_string())),
                }),
                CannedResponse::Stream { status, frames } => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for frame in frames {
                            if tx.send(Bytes::from_static(frame.as_bytes())).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamHttpResponse {
                        status,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: UpstreamResponseBody::Stream(rx),
                    })
                }
            }
        })
    }
}

struct Harness {
    engine: Arc<Engine>,
    upstream: Arc<FakeUpstream>,
    pool: Arc<CredentialPool>,
    users: Arc<UserStore>,
}

async fn harness(credentials: Vec<CredentialSeed>) -> Harness {
    let pool = Arc::new(CredentialPool::new());
    for seed in credentials {
        pool.insert(Credential::from_seed(seed)).await;
    }
    let users = Arc::new(
        UserStore::load(Arc::new(MemoryPersistence::new()), 5, IpLimitPolicy::Limit)
            .await
            .unwrap(),
    );
    let upstream = Arc::new(FakeUpstream::default());
    let engine = Engine::new(
        pool.clone(),
        users.clone(),
        upstream.clone(),
        EventHub::new(64),
        EngineConfig {
            data_dir: "./target/test-data".to_string(),
            proxy: None,
            prefer_native_count: false,
        },
    )
    .unwrap();
    Harness {
        engine,
        upstream,
        pool,
        users,
    }
}

fn seed(service: Service, secret: &str) -> CredentialSeed {
    CredentialSeed {
        secret: secret.to_string(),
        service,
        model_families: None,
        kind: None,
    }
}

fn inbound(service: Service, op: RouteOp, format: ApiFormat, body: serde_json::Value) -> InboundRequest {
    InboundRequest {
        trace_id: "test-trace".to_string(),
        service,
        inbound_format: format,
        op,
        raw_body: Bytes::from(body.to_string()),
        model_from_path: None,
        stream_from_path: false,
        user_token: None,
        ip: "10.0.0.1".to_string(),
        user_agent: None,
    }
}

fn openai_chat_body(model: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 10
    })
}

async fn json_body(response: ClientResponse) -> (u16, serde_json::Value) {
    match response {
        ClientResponse::Json { status, body, .. } => {
            (status, serde_json::from_slice(&body).unwrap())
        }
        ClientResponse::Stream { .. } => panic!("expected json response"),
    }
}

// An OpenAI-shaped request for a Claude model is rerouted to /v1/messages.
#[tokio::test]
async fn openai_to_anthropic_reroute() {
    let h = harness(vec![seed(Service::Anthropic, "sk-ant-1")]).await;
    h.upstream.push_json(
        200,
        json!({
            "id": "msg_X",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        }),
    );

    let response = h
        .engine
        .handle(inbound(
            Service::Anthropic,
            RouteOp::ChatCompletions,
            ApiFormat::Openai,
            openai_chat_body("claude-3-5-sonnet-latest"),
        ))
        .await
        .unwrap();

    let (status, body) = json_body(response).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], "ant-msg_X");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "end_turn");
    assert_eq!(body["usage"]["prompt_tokens"], 3);
    assert_eq!(body["proxy"]["in_api"], "openai");
    assert_eq!(body["proxy"]["out_api"], "anthropic-chat");
    assert_eq!(body["proxy"]["prompt_transformed"], true);

    // The upstream saw the native Anthropic endpoint with the alias resolved.
    let sent = h.upstream.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].url.ends_with("/v1/messages"));
    let upstream_body: serde_json::Value =
        serde_json::from_slice(sent[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(upstream_body["model"], "claude-3-5-sonnet-20241022");
    assert!(
        sent[0]
            .headers
            .iter()
            .any(|(name, value)| name == "x-api-key" && value == "sk-ant-1")
    );

    // Billing went to the pool under the claude family.
    let credential = h.pool.list(Service::Anthropic).await.remove(0);
    let usage = &credential.token_usage[&ModelFamily::Claude];
    assert_eq!(usage.input, 3);
    assert_eq!(usage.output, 1);
}

// A 429 locks the credential out and the retry lands on the other key.
#[tokio::test(start_paused = true)]
async fn rate_limit_rotates_to_second_credential() {
    let h = harness(vec![
        seed(Service::Anthropic, "sk-ant-k1"),
        seed(Service::Anthropic, "sk-ant-k2"),
    ])
    .await;
    h.upstream
        .push_json(429, json!({"error": {"type": "rate_limit_error"}}));
    h.upstream.push_json(
        200,
        json!({
            "id": "msg_2",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }),
    );

    let response = h
        .engine
        .handle(inbound(
            Service::Anthropic,
            RouteOp::Messages,
            ApiFormat::AnthropicChat,
            json!({
                "model": "claude-3-5-sonnet-20241022",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ))
        .await
        .unwrap();
    let (status, _) = json_body(response).await;
    assert_eq!(status, 200);

    let sent = h.upstream.sent();
    assert_eq!(sent.len(), 2);
    let key = |request: &UpstreamHttpRequest| {
        request
            .headers
            .iter()
            .find(|(name, _)| name == "x-api-key")
            .map(|(_, value)| value.clone())
            .unwrap()
    };
    assert_ne!(key(&sent[0]), key(&sent[1]), "retry must rotate credentials");

    // The rate-limited credential carries a real lockout.
    let limited_key = key(&sent[0]);
    let limited = h
        .pool
        .list(Service::Anthropic)
        .await
        .into_iter()
        .find(|credential| credential.secret == limited_key)
        .unwrap();
    let (at, until) = (
        limited.rate_limited_at.unwrap(),
        limited.rate_limited_until.unwrap(),
    );
    assert!(until >= at);
}

// An over-quota user gets 402 without the upstream ever being contacted.
#[tokio::test]
async fn quota_refusal_is_402_before_upstream() {
    let h = harness(vec![seed(Service::Anthropic, "sk-ant-1")]).await;
    let user = h
        .users
        .create(UserPatch {
            token_limits: Some([(ModelFamily::Claude, 1000u64)].into_iter().collect()),
            ..Default::default()
        })
        .await;
    h.users
        .increment_token_count(&user.token, ModelFamily::Claude, 950, 0)
        .await;

    let mut request = inbound(
        Service::Anthropic,
        RouteOp::Messages,
        ApiFormat::AnthropicChat,
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "a fairly long prompt that counts tokens"}]
        }),
    );
    request.user_token = Some(user.token.clone());

    let err = h.engine.handle(request).await.unwrap_err();
    assert_eq!(err.status, 402);
    assert_eq!(err.body["family"], "claude");
    assert!(h.upstream.sent().is_empty(), "admission must precede dispatch");
}

// SSE passthrough is byte-exact while the synthetic aggregate drives billing.
#[tokio::test]
async fn streaming_aggregation_and_usage() {
    let h = harness(vec![seed(Service::Openai, "sk-oai-1")]).await;
    h.upstream.push_stream(
        200,
        vec![
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"A\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"B\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"C\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3,\"total_tokens\":10}}\n\n",
            "data: [DONE]\n\n",
        ],
    );

    let mut body = openai_chat_body("gpt-4o");
    body["stream"] = json!(true);
    let response = h
        .engine
        .handle(inbound(
            Service::Openai,
            RouteOp::ChatCompletions,
            ApiFormat::Openai,
            body,
        ))
        .await
        .unwrap();

    let ClientResponse::Stream { status, mut body, .. } = response else {
        panic!("expected stream");
    };
    assert_eq!(status, 200);
    let mut forwarded = Vec::new();
    while let Some(chunk) = body.recv().await {
        forwarded.extend_from_slice(&chunk);
    }
    let text = String::from_utf8(forwarded).unwrap();
    // Verbatim passthrough, delta order intact.
    assert!(text.contains("\"content\":\"A\""));
    assert!(text.contains("\"content\":\"C\""));
    assert!(text.ends_with("data: [DONE]\n\n"));

    // Billing lands once the stream finishes.
    let mut billed = None;
    for _ in 0..50 {
        let credential = h.pool.list(Service::Openai).await.remove(0);
        if let Some(usage) = credential.token_usage.get(&ModelFamily::Gpt4o)
            && usage.output > 0
        {
            billed = Some(usage.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let billed = billed.expect("stream billing never landed");
    assert_eq!(billed.input, 7);
    assert_eq!(billed.output, 3);
}

// Three consecutive Moonshot 429s exhaust the retry budget and surface a note.
#[tokio::test(start_paused = true)]
async fn moonshot_retry_budget_exhaustion() {
    let h = harness(vec![seed(Service::Moonshot, "sk-moon-1")]).await;
    for _ in 0..3 {
        h.upstream
            .push_json(429, json!({"error": {"message": "too many requests"}}));
    }

    let err = h
        .engine
        .handle(inbound(
            Service::Moonshot,
            RouteOp::ChatCompletions,
            ApiFormat::Openai,
            openai_chat_body("kimi-k2-0711-preview"),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.status, 429);
    assert_eq!(
        err.body["proxy_note"],
        "Too many requests to the Moonshot API. Please try again later."
    );
    assert_eq!(h.upstream.sent().len(), 3);
}

// Streaming a non-streamable model is rejected before enqueue.
#[tokio::test]
async fn stream_request_for_nonstreamable_model_is_400() {
    let h = harness(vec![seed(Service::Openai, "sk-oai-1")]).await;
    let mut body = openai_chat_body("o1");
    body["stream"] = json!(true);
    let err = h
        .engine
        .handle(inbound(
            Service::Openai,
            RouteOp::ChatCompletions,
            ApiFormat::Openai,
            body,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert!(h.upstream.sent().is_empty());
}

// Claude 4.1 Opus with both sampling knobs off-default is rejected.
#[tokio::test]
async fn claude_41_sampling_exclusivity() {
    let h = harness(vec![seed(Service::Anthropic, "sk-ant-1")]).await;
    let err = h
        .engine
        .handle(inbound(
            Service::Anthropic,
            RouteOp::Messages,
            ApiFormat::AnthropicChat,
            json!({
                "model": "claude-opus-4-1-20250805",
                "max_tokens": 16,
                "temperature": 0.5,
                "top_p": 0.9,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert!(h.upstream.sent().is_empty());
}

// Content-filter refusals refund the admitted prompt tokens.
#[tokio::test]
async fn content_filter_refunds_admission() {
    let h = harness(vec![seed(Service::Anthropic, "sk-ant-1")]).await;
    let user = h.users.create(UserPatch::default()).await;
    h.upstream.push_json(
        400,
        json!({"error": {"type": "invalid_request_error", "message": "Output blocked by content filtering policy"}}),
    );

    let mut request = inbound(
        Service::Anthropic,
        RouteOp::Messages,
        ApiFormat::AnthropicChat,
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    );
    request.user_token = Some(user.token.clone());

    let err = h.engine.handle(request).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.body["error"]["type"], "content_filtered");

    let row = h.users.get(&user.token).await.unwrap();
    let input = row
        .token_counts
        .get(&ModelFamily::Claude)
        .map(|counts| counts.input)
        .unwrap_or(0);
    assert_eq!(input, 0, "admission charge must be refunded");
}

// Two cache-marked requests with different tails share a credential.
#[tokio::test]
async fn cache_affinity_stickiness_end_to_end() {
    let h = harness(vec![
        seed(Service::Anthropic, "sk-ant-a"),
        seed(Service::Anthropic, "sk-ant-b"),
    ])
    .await;
    let success = |id: &str| {
        json!({
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 1,
                "cache_creation_input_tokens": 8
            }
        })
    };
    h.upstream.push_json(200, success("msg_1"));
    h.upstream.push_json(200, success("msg_2"));

    let request_with_tail = |tail: &str| {
        inbound(
            Service::Anthropic,
            RouteOp::Messages,
            ApiFormat::AnthropicChat,
            json!({
                "model": "claude-3-5-sonnet-20241022",
                "max_tokens": 16,
                "system": [{
                    "type": "text",
                    "text": "big shared persona",
                    "cache_control": {"type": "ephemeral"}
                }],
                "messages": [{"role": "user", "content": tail}]
            }),
        )
    };

    h.engine.handle(request_with_tail("first tail")).await.unwrap();
    h.engine.handle(request_with_tail("second, different tail")).await.unwrap();

    let sent = h.upstream.sent();
    assert_eq!(sent.len(), 2);
    let key = |request: &UpstreamHttpRequest| {
        request
            .headers
            .iter()
            .find(|(name, _)| name == "x-api-key")
            .map(|(_, value)| value.clone())
            .unwrap()
    };
    assert_eq!(key(&sent[0]), key(&sent[1]), "cache affinity must stick");
}

// FIFO ordering within a family.
#[tokio::test]
async fn queue_preserves_fifo_per_family() {
    let pool = Arc::new(CredentialPool::new());
    pool.insert(Credential::from_seed(seed(Service::Anthropic, "sk-ant-1")))
        .await;
    let queues = mproxy_core::QueueSet::new(pool);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for index in 0..5 {
        let queues = queues.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let ticket = queues.enqueue(ModelFamily::Claude).await;
            order.lock().unwrap().push(index);
            drop(ticket);
        }));
        // Serialize enqueue order.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn unknown_body_is_rejected() {
    let h = harness(vec![seed(Service::Openai, "sk-oai-1")]).await;
    let err = h
        .engine
        .handle(InboundRequest {
            raw_body: Bytes::from_static(b"not json"),
            ..inbound(
                Service::Openai,
                RouteOp::ChatCompletions,
                ApiFormat::Openai,
                json!({}),
            )
        })
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
}

#[tokio::test]
async fn no_credentials_is_503() {
    let h = harness(vec![]).await;
    let err: RequestError = h
        .engine
        .handle(inbound(
            Service::Openai,
            RouteOp::ChatCompletions,
            ApiFormat::Openai,
            openai_chat_body("gpt-4o"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.status, 503);
    assert_eq!(err.body["family"], "gpt4o");
}
