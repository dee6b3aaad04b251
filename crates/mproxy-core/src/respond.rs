use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use mproxy_protocol::ApiFormat;
use mproxy_protocol::sse::SseFrameReader;
use mproxy_transform::{
    AggregatedStream, ResponseBody, StreamAggregator, UsageSummary, shape_response,
    usage_from_response,
};

use crate::classify::{ErrorClass, classify_upstream_error};
use crate::context::{ClientResponse, RequestContext, RequestError};
use crate::tokens::TokenCounter;
use crate::upstream::ByteStream;

/// Headers never forwarded from upstream to the client.
const HEADER_BLACKLIST: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "content-length",
    "connection",
    "keep-alive",
    "set-cookie",
    "openai-organization",
    "x-request-id",
    "request-id",
    "cf-ray",
    "cf-cache-status",
    "alt-svc",
];

/// Flat token equivalence for one generated image, used to bill image
/// families against token quotas.
const IMAGE_OUTPUT_TOKEN_EQUIVALENT: u64 = 8_192;

/// What one successful blocking response produced, after the middleware ran.
pub struct BlockingResult {
    pub client: ClientResponse,
    pub usage: UsageSummary,
    pub completion_excerpt: String,
    /// URLs (or inline payloads) of generated images, for the image sink.
    pub image_urls: Vec<String>,
}

/// Classifies a failed upstream attempt. This is the single classification
/// point; the dispatch loop decides what to do with the class.
pub fn handle_upstream_errors(ctx: &RequestContext, status: u16, body: &[u8]) -> ErrorClass {
    let text = String::from_utf8_lossy(body);
    let class = classify_upstream_error(ctx.service, status, &text);
    debug!(
        event = "upstream_error_classified",
        trace_id = %ctx.trace_id,
        service = %ctx.service,
        status,
        class = ?class
    );
    class
}

/// The blocking path: parse, run the middleware in order, shape back to the
/// inbound dialect and attach the proxy info object.
pub fn handle_blocking_success(
    ctx: &RequestContext,
    counter: &TokenCounter,
    status: u16,
    upstream_headers: &[(String, String)],
    body: &Bytes,
) -> Result<BlockingResult, RequestError> {
    track_key_rate_limit(ctx, upstream_headers);

    // Embeddings ride the OpenAI dialect but have their own response shape;
    // they pass through opaque.
    let parsed = if matches!(ctx.body, mproxy_transform::RequestBody::Embeddings(_)) {
        serde_json::from_slice(body).map(ResponseBody::Embeddings)
    } else {
        parse_response(ctx.outbound_format, body)
    }
    .map_err(|err| RequestError::internal(format!("upstream response decode: {err}")))?;

    let usage = count_response_tokens(ctx, counter, &parsed);
    let completion = parsed.flat_text();
    let image_urls = match &parsed {
        ResponseBody::OpenaiImage(images) => images
            .data
            .iter()
            .filter_map(|image| {
                image
                    .url
                    .clone()
                    .or_else(|| image.b64_json.as_ref().map(|b64| format!("b64:{}", b64.len())))
            })
            .collect(),
        _ => Vec::new(),
    };

    let shaped = shape_response(
        ctx.inbound_format,
        &ctx.model,
        time::OffsetDateTime::now_utc().unix_timestamp(),
        parsed,
    )
    .map_err(|err| RequestError::internal(format!("response shaping: {err}")))?;

    let mut value: serde_json::Value = {
        let bytes = shaped
            .to_json()
            .map_err(|err| RequestError::internal(format!("response encode: {err}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| RequestError::internal(format!("response encode: {err}")))?
    };
    inject_proxy_info(ctx, &usage, &mut value);
    let body = Bytes::from(value.to_string());

    let mut headers = copy_http_headers(upstream_headers);
    headers.push(("content-type".to_string(), "application/json".to_string()));

    Ok(BlockingResult {
        client: ClientResponse::Json {
            status,
            headers,
            body,
        },
        usage,
        completion_excerpt: excerpt(&completion),
        image_urls,
    })
}

/// The streaming path: tee upstream bytes to the client verbatim while
/// aggregating events into a synthetic blocking view for billing. Nothing on
/// this path writes to the client body besides the forwarder.
pub fn handle_stream_success(
    ctx: &RequestContext,
    status: u16,
    upstream_headers: &[(String, String)],
    mut upstream: ByteStream,
) -> (ClientResponse, oneshot::Receiver<AggregatedStream>) {
    track_key_rate_limit(ctx, upstream_headers);

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let (aggregate_tx, aggregate_rx) = oneshot::channel();
    let format = ctx.outbound_format;
    let trace_id = ctx.trace_id.clone();

    tokio::spawn(async move {
        let mut reader = SseFrameReader::new();
        let mut aggregator = StreamAggregator::new(format);
        let mut client_gone = false;
        while let Some(chunk) = upstream.recv().await {
            for frame in reader.push(&chunk) {
                aggregator.push_frame(&frame);
            }
            // A disconnected client cancels forwarding but not aggregation:
            // the upstream has been charged, so billing must complete.
            if !client_gone && tx.send(chunk).await.is_err() {
                client_gone = true;
                debug!(event = "client_disconnected", trace_id = %trace_id);
            }
        }
        if let Some(frame) = reader.finish() {
            aggregator.push_frame(&frame);
        }
        let _ = aggregate_tx.send(aggregator.finish());
    });

    let headers = copy_http_headers(upstream_headers);
    (
        ClientResponse::Stream {
            status,
            headers,
            content_type: "text/event-stream",
            body: rx,
        },
        aggregate_rx,
    )
}

fn parse_response(format: ApiFormat, body: &Bytes) -> Result<ResponseBody, serde_json::Error> {
    Ok(match format {
        ApiFormat::Openai => ResponseBody::Openai(serde_json::from_slice(body)?),
        ApiFormat::OpenaiResponses => ResponseBody::OpenaiResponses(serde_json::from_slice(body)?),
        ApiFormat::OpenaiImage => ResponseBody::OpenaiImage(serde_json::from_slice(body)?),
        ApiFormat::AnthropicChat => ResponseBody::AnthropicChat(serde_json::from_slice(body)?),
        ApiFormat::AnthropicText => ResponseBody::AnthropicText(serde_json::from_slice(body)?),
        ApiFormat::GoogleAi => ResponseBody::GoogleAi(serde_json::from_slice(body)?),
        ApiFormat::MistralAi => ResponseBody::MistralAi(serde_json::from_slice(body)?),
    })
}

/// Authoritative provider counts win; local tokenization covers the rest.
/// Image responses bill per image at a flat token equivalence.
fn count_response_tokens(
    ctx: &RequestContext,
    counter: &TokenCounter,
    parsed: &ResponseBody,
) -> UsageSummary {
    if let ResponseBody::OpenaiImage(images) = parsed {
        return UsageSummary {
            input_tokens: Some(ctx.prompt_tokens),
            output_tokens: Some(images.data.len() as u64 * IMAGE_OUTPUT_TOKEN_EQUIVALENT),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            reasoning_tokens: None,
        };
    }

    let mut usage = usage_from_response(parsed).unwrap_or_default();
    if usage.input_tokens.is_none() {
        usage.input_tokens = Some(ctx.prompt_tokens);
    }
    if usage.output_tokens.is_none() {
        let (count, _) = counter.count_text(ctx.service, ctx.family, &parsed.flat_text());
        usage.output_tokens = Some(count);
    }
    cache_sanity_check(ctx, &usage);
    usage
}

/// The request carried cache markers but the provider reported no cache
/// read or creation. Log loudly, do not fail.
fn cache_sanity_check(ctx: &RequestContext, usage: &UsageSummary) {
    if ctx.fingerprints.is_some()
        && matches!(
            ctx.service,
            mproxy_registry::Service::Anthropic
                | mproxy_registry::Service::Aws
                | mproxy_registry::Service::Gcp
        )
        && !usage.saw_cache_activity()
    {
        error!(
            event = "prompt_cache_sanity_failed",
            trace_id = %ctx.trace_id,
            model = %ctx.model,
            "request used cache_control but response reports no cache metrics"
        );
    }
}

fn track_key_rate_limit(ctx: &RequestContext, headers: &[(String, String)]) {
    let remaining_requests = header_value(headers, "x-ratelimit-remaining-requests");
    let remaining_tokens = header_value(headers, "x-ratelimit-remaining-tokens");
    if remaining_requests.is_some() || remaining_tokens.is_some() {
        debug!(
            event = "key_rate_limit",
            trace_id = %ctx.trace_id,
            remaining_requests = ?remaining_requests,
            remaining_tokens = ?remaining_tokens
        );
        if let Some(remaining) = remaining_requests
            && remaining.parse::<i64>().map(|n| n <= 1).unwrap_or(false)
        {
            warn!(
                event = "key_rate_limit_nearly_exhausted",
                trace_id = %ctx.trace_id
            );
        }
    }
}

fn copy_http_headers(upstream: &[(String, String)]) -> Vec<(String, String)> {
    upstream
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !HEADER_BLACKLIST.contains(&lower.as_str()) && lower != "content-type"
        })
        .cloned()
        .collect()
}

/// Blocking-only: attach the proxy object describing what happened to the
/// request on its way through.
fn inject_proxy_info(ctx: &RequestContext, usage: &UsageSummary, value: &mut serde_json::Value) {
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "proxy".to_string(),
            serde_json::json!({
                "logged": false,
                "tokens": {
                    "input": usage.input_tokens,
                    "output": usage.billable_output(),
                },
                "service": ctx.service.as_str(),
                "in_api": ctx.inbound_format.as_str(),
                "out_api": ctx.outbound_format.as_str(),
                "prompt_transformed": ctx.inbound_format != ctx.outbound_format,
            }),
        );
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn excerpt(text: &str) -> String {
    text.chars().take(512).collect()
}

/// Billable deltas derived from a usage summary.
pub fn billing_delta(usage: &UsageSummary) -> (u64, u64) {
    (
        usage.input_tokens.unwrap_or(0),
        usage.billable_output().unwrap_or(0),
    )
}
