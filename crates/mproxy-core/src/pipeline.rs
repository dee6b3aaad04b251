use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{info, warn};

use mproxy_pool::auth::gcp;
use mproxy_pool::{
    Credential, CredentialKind, CredentialPool, DisabledReason, SelectError, SelectRequest,
    UsageDelta, fingerprint,
};
use mproxy_protocol::ApiFormat;
use mproxy_protocol::anthropic::chat::Tool;
use mproxy_protocol::openai::models::ModelList;
use mproxy_registry::{ModelFamily, Service, classify, reassign_model, sample_models};
use mproxy_transform::{RequestBody, UsageSummary, transform_request};
use mproxy_users::{QuotaCheck, UserStore};

use crate::change::ChangeManager;
use crate::classify::{ErrorClass, rate_limit_note, retry_backoff, retry_budget};
use crate::context::{
    ClientResponse, InboundRequest, RequestContext, RequestError, RouteOp,
};
use crate::events::{DownstreamEvent, Event, EventHub, PromptEvent, UpstreamEvent};
use crate::models_cache::ModelsCache;
use crate::mutate;
use crate::queue::QueueSet;
use crate::respond;
use crate::tokens::TokenCounter;
use crate::upstream::{UpstreamClient, UpstreamHttpRequest, UpstreamResponseBody};

const NATIVE_COUNT_TIMEOUT: Duration = Duration::from_secs(5);
/// Above this prompt size the 1M-context beta is requested on Claude.
const LONG_CONTEXT_THRESHOLD: u64 = 200_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: String,
    pub proxy: Option<String>,
    /// Ask the provider's counting endpoint for exact prompt sizes when a
    /// key is available. Off means always use the local tokenizers.
    pub prefer_native_count: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            proxy: None,
            prefer_native_count: true,
        }
    }
}

/// The request pipeline: stage A (validate → transform → touch up → count →
/// admit → enqueue) and stage B (bind credential → mutate → dispatch →
/// respond → bill), with retry-and-rotate around stage B.
pub struct Engine {
    pool: Arc<CredentialPool>,
    users: Arc<UserStore>,
    queues: Arc<QueueSet>,
    client: Arc<dyn UpstreamClient>,
    events: EventHub,
    counter: TokenCounter,
    oauth_client: wreq::Client,
    models: ModelsCache,
    prefer_native_count: bool,
    /// On-demand credential rechecks (OpenRouter balance refresh).
    checker: Option<Arc<mproxy_pool::checker::HealthChecker>>,
}

/// Paid OpenRouter keys get their balance re-probed this often, counted in
/// prompts served.
const OPENROUTER_BALANCE_RECHECK_EVERY: u64 = 50;

impl Engine {
    pub fn new(
        pool: Arc<CredentialPool>,
        users: Arc<UserStore>,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
        config: EngineConfig,
    ) -> Result<Arc<Self>, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(NATIVE_COUNT_TIMEOUT);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        let checker =
            mproxy_pool::checker::HealthChecker::new(pool.clone(), config.proxy.as_deref())
                .ok()
                .map(Arc::new);
        Ok(Arc::new(Self {
            queues: QueueSet::new(pool.clone()),
            pool,
            users,
            client,
            events,
            counter: TokenCounter::new(&config.data_dir),
            oauth_client: builder.build()?,
            models: ModelsCache::new(),
            prefer_native_count: config.prefer_native_count,
            checker,
        }))
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }

    /// `GET /v1/models`, cached for 60 seconds per service.
    pub async fn list_models(&self, service: Service) -> ModelList {
        let mut families: Vec<ModelFamily> = Vec::new();
        for credential in self.pool.list(service).await {
            if credential.is_disabled || credential.is_revoked {
                continue;
            }
            for family in &credential.model_families {
                if !families.contains(family) {
                    families.push(*family);
                }
            }
        }
        families.sort();
        let created = OffsetDateTime::now_utc().unix_timestamp();
        self.models.get_or_insert_with(service, || {
            let mut ids: Vec<String> = Vec::new();
            for family in &families {
                ids.extend(sample_models(*family).iter().map(|id| id.to_string()));
            }
            ModelList::new(ids, service.as_str(), created)
        })
    }

    /// Queue/health introspection for the front door.
    pub async fn family_status(&self, family: ModelFamily) -> serde_json::Value {
        json!({
            "family": family.as_str(),
            "queued": self.queues.depth(family).await,
            "estimated_wait_ms": self.queues.estimated_wait(family).await.as_millis() as u64,
            "lockout_ms": self.pool.lockout_remaining(family).await.as_millis() as u64,
            "credentials": self.pool.candidate_count(family).await,
        })
    }

    /// Entry point: the full pipeline for one inbound request.
    pub async fn handle(self: &Arc<Self>, inbound: InboundRequest) -> Result<ClientResponse, RequestError> {
        let started = Instant::now();
        let trace_id = inbound.trace_id.clone();
        let service = inbound.service;

        let result = self.run(inbound).await;

        let (status, model, family, is_stream) = match &result {
            Ok(ClientResponse::Json { status, .. }) => (*status, None, None, false),
            Ok(ClientResponse::Stream { status, .. }) => (*status, None, None, true),
            Err(err) => (err.status, None, None, false),
        };
        self.events
            .emit(Event::Downstream(DownstreamEvent {
                trace_id,
                at: SystemTime::now(),
                service,
                model,
                family,
                user_token_hash: None,
                status,
                is_stream,
                elapsed_ms: started.elapsed().as_millis(),
            }))
            .await;
        result
    }

    async fn run(self: &Arc<Self>, inbound: InboundRequest) -> Result<ClientResponse, RequestError> {
        let mut ctx = self.prepare(inbound).await?;
        self.dispatch(&mut ctx).await
    }

    // ---- Stage A ----------------------------------------------------------

    async fn prepare(&self, inbound: InboundRequest) -> Result<RequestContext, RequestError> {
        // 1. Inbound validation: parse into the typed AST for the dialect.
        let mut body = parse_body(&inbound)?;

        // 2. Model normalization.
        let raw_model = extract_model(&body, inbound.model_from_path.as_deref())
            .ok_or_else(|| RequestError::bad_request("missing model"))?;
        let model = reassign_model(inbound.service, &raw_model);
        set_model(&mut body, &model);
        let family = classify(inbound.service, &model);

        // 3. Outbound transform.
        let outbound_format = outbound_format(inbound.service, family, inbound.op, &model);
        let mut body = transform_request(outbound_format, body)
            .map_err(|err| RequestError::bad_request(err.to_string()))?;

        let is_streaming = body.is_stream() || inbound.stream_from_path;
        let mut ctx = RequestContext {
            trace_id: inbound.trace_id,
            service: inbound.service,
            inbound_format: inbound.inbound_format,
            outbound_format,
            model: model.clone(),
            family,
            body: RequestBody::Openai(placeholder_body()),
            is_streaming,
            prompt_tokens: 0,
            output_tokens: 0,
            retry_count: 0,
            tokenizer: None,
            fingerprints: None,
            user_token: inbound.user_token,
            credential: None,
            changes: ChangeManager::new(),
            anthropic_beta: Vec::new(),
        };

        // 4. Per-service touch-ups.
        touch_up(&mut ctx, &mut body)?;

        // 5. Streaming eligibility, before anything is queued.
        if is_streaming {
            streaming_allowed(family, &model)?;
        } else if must_stream(&model) {
            return Err(RequestError::bad_request(
                "this model only answers streaming requests; set stream: true",
            )
            .with_model(&model));
        }

        // 6. Cache fingerprints (Anthropic-family chat bodies only).
        if let RequestBody::AnthropicChat(chat) = &body {
            ctx.fingerprints = fingerprint(chat);
            if ctx
                .fingerprints
                .as_ref()
                .map(|set| set.ttl >= Duration::from_secs(3600))
                .unwrap_or(false)
            {
                push_unique(&mut ctx.anthropic_beta, "extended-cache-ttl-2025-04-11");
            }
        }

        // 7. Prompt token count: native endpoint when a key is obtainable,
        // local tokenizer otherwise.
        let (prompt_tokens, tokenizer) = match self.native_prompt_count(&ctx, &body).await {
            Some(count) => (
                count,
                crate::tokens::TokenizerInfo {
                    name: "provider-native",
                    native: true,
                },
            ),
            None => self.counter.count_prompt(ctx.service, family, &body),
        };
        ctx.prompt_tokens = prompt_tokens;
        ctx.tokenizer = Some(tokenizer);
        ctx.output_tokens = body.claimed_output_tokens();
        if matches!(
            ctx.service,
            Service::Anthropic | Service::Aws | Service::Gcp
        ) && prompt_tokens > LONG_CONTEXT_THRESHOLD
        {
            push_unique(&mut ctx.anthropic_beta, "context-1m-2025-08-07");
        }

        // 8. Quota admission.
        if let Some(token) = ctx.user_token.as_deref() {
            let requested = ctx.prompt_tokens.saturating_add(ctx.output_tokens);
            let admitted = self
                .users
                .has_available_quota(QuotaCheck {
                    token,
                    service: ctx.service,
                    model: &ctx.model,
                    requested,
                })
                .await;
            if !admitted {
                return Err(RequestError::quota(family).with_model(&ctx.model));
            }
            self.users.increment_prompt_count(token).await;
            // Provisional charge for the admitted prompt; replaced by the
            // authoritative usage at billing time, refunded on a content
            // filter.
            self.users
                .increment_token_count(token, family, ctx.prompt_tokens, 0)
                .await;
        }

        ctx.body = body;
        Ok(ctx)
    }

    /// Anthropic's count endpoint gives exact numbers when any key of the
    /// family is usable; the key is only borrowed for this probe.
    async fn native_prompt_count(&self, ctx: &RequestContext, body: &RequestBody) -> Option<u64> {
        if !self.prefer_native_count || ctx.service != Service::Anthropic {
            return None;
        }
        let RequestBody::AnthropicChat(chat) = body else {
            return None;
        };
        let credential = self
            .pool
            .select(&ctx.model, ctx.service, &SelectRequest::default())
            .await
            .ok()?;
        let payload = json!({
            "model": &chat.model,
            "messages": &chat.messages,
            "system": &chat.system,
            "tools": &chat.tools,
        });
        let resp = self
            .oauth_client
            .post("https://api.anthropic.com/v1/messages/count_tokens")
            .header("x-api-key", credential.secret)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let value: serde_json::Value = resp.json().await.ok()?;
        value["input_tokens"].as_u64()
    }

    // ---- Stage B + response ----------------------------------------------

    async fn dispatch(self: &Arc<Self>, ctx: &mut RequestContext) -> Result<ClientResponse, RequestError> {
        let mut rate_limit_hits: u32 = 0;
        let mut transient_hits: u32 = 0;
        let mut rotate_hits: u32 = 0;
        let budget = retry_budget(ctx.service);

        // Initial FIFO enqueue; retries re-enter at the head after a backoff.
        let mut ticket = self.queues.enqueue(ctx.family).await;

        loop {
            // 1. Bind a credential.
            let credential = match self
                .pool
                .select(
                    &ctx.model,
                    ctx.service,
                    &SelectRequest {
                        fingerprint: ctx.fingerprints.as_ref().map(|set| set.full().to_string()),
                        wants_free_tier: ctx.model.ends_with(":free"),
                    },
                )
                .await
            {
                Ok(credential) => credential,
                Err(SelectError::NoKeyAvailable(family)) => {
                    return Err(RequestError::no_credentials(family).with_model(&ctx.model));
                }
            };
            ctx.credential = Some(credential.clone());

            // AWS signing happens inside the mutators; GCP needs a live
            // OAuth token first.
            let gcp_token = self.resolve_gcp_token(&credential).await?;

            // 2. Body/header/path mutations, tracked for revert.
            let mut outbound = mutate::build_outbound(ctx, &credential, gcp_token.as_deref())?;
            let attempt = ctx.retry_count + 1;

            // 3. Dispatch.
            let request = UpstreamHttpRequest {
                method: outbound.method.clone(),
                url: outbound.url.clone(),
                headers: outbound.headers.clone(),
                body: outbound.serialized.clone(),
                is_stream: ctx.is_streaming,
            };
            let sent = self.client.send(request).await;

            // Owned copies so event construction never borrows the context.
            let event_trace_id = ctx.trace_id.clone();
            let event_service = ctx.service;
            let event_credential = credential.hash.clone();
            let emit_upstream = move |status: Option<u16>,
                                      usage: Option<UsageSummary>,
                                      error: Option<String>| {
                Event::Upstream(UpstreamEvent {
                    trace_id: event_trace_id.clone(),
                    at: SystemTime::now(),
                    service: event_service,
                    credential_hash: event_credential.clone(),
                    attempt,
                    status,
                    usage,
                    error,
                })
            };

            let response = match sent {
                Ok(response) => response,
                Err(failure) => {
                    ctx.changes.revert_all(&mut outbound);
                    self.events
                        .emit(emit_upstream(None, None, Some(failure.to_string())))
                        .await;
                    transient_hits += 1;
                    if transient_hits > budget {
                        return Err(RequestError::upstream(
                            502,
                            failure.to_string(),
                            "upstream unreachable after retries",
                        ));
                    }
                    ctx.retry_count += 1;
                    drop(ticket);
                    ticket = self
                        .queues
                        .reenqueue(ctx.family, retry_backoff(ctx.service, transient_hits))
                        .await;
                    continue;
                }
            };

            let status = response.status;
            if !(200..300).contains(&status) {
                let body = match response.body {
                    UpstreamResponseBody::Bytes(bytes) => bytes,
                    UpstreamResponseBody::Stream(mut rx) => {
                        let mut collected = Vec::new();
                        while let Some(chunk) = rx.recv().await {
                            collected.extend_from_slice(&chunk);
                        }
                        bytes::Bytes::from(collected)
                    }
                };
                ctx.changes.revert_all(&mut outbound);
                let class = respond::handle_upstream_errors(ctx, status, &body);
                self.events
                    .emit(emit_upstream(Some(status), None, Some(format!("{class:?}"))))
                    .await;

                match class {
                    ErrorClass::BadRequest(message) => {
                        return Err(RequestError::bad_request(message).with_model(&ctx.model));
                    }
                    ErrorClass::ContentFiltered(message) => {
                        // Refund the admission charge; upstream never billed.
                        if let Some(token) = ctx.user_token.as_deref() {
                            self.users
                                .refund_token_count(token, ctx.family, ctx.prompt_tokens)
                                .await;
                        }
                        return Err(RequestError::new(
                            400,
                            "content_filtered",
                            message,
                            "the upstream content filter blocked this request; the tokens were refunded",
                        )
                        .with_model(&ctx.model));
                    }
                    ErrorClass::Unauthorized => {
                        self.pool
                            .disable(&credential.hash, DisabledReason::Revoked)
                            .await;
                        rotate_hits += 1;
                        if rotate_hits > budget {
                            return Err(RequestError::upstream(
                                502,
                                "upstream rejected every credential",
                                "credentials revoked during dispatch",
                            ));
                        }
                    }
                    ErrorClass::CredentialOverQuota => {
                        self.pool
                            .disable(&credential.hash, DisabledReason::Quota)
                            .await;
                        rotate_hits += 1;
                        if rotate_hits > budget {
                            return Err(RequestError::upstream(
                                502,
                                "upstream credentials exhausted",
                                "credential accounts out of funds",
                            ));
                        }
                    }
                    ErrorClass::RateLimited => {
                        self.pool.mark_rate_limited(&credential.hash).await;
                        rate_limit_hits += 1;
                        if rate_limit_hits >= budget {
                            let note = rate_limit_note(ctx.service);
                            return Err(RequestError::rate_limited(&note).with_model(&ctx.model));
                        }
                    }
                    ErrorClass::ModelUnavailable => {
                        if ctx.service == Service::GoogleAi {
                            self.pool
                                .mark_family_over_quota(&credential.hash, ctx.family)
                                .await;
                        } else {
                            self.pool.mark_rate_limited(&credential.hash).await;
                        }
                        rotate_hits += 1;
                        if rotate_hits > budget {
                            return Err(RequestError::no_credentials(ctx.family)
                                .with_model(&ctx.model));
                        }
                    }
                    ErrorClass::UpstreamTransient => {
                        transient_hits += 1;
                        if transient_hits > budget {
                            return Err(RequestError::upstream(
                                502,
                                String::from_utf8_lossy(&body).to_string(),
                                "upstream kept failing after retries",
                            ));
                        }
                    }
                    ErrorClass::Fatal(message) => {
                        return Err(RequestError::new(
                            500,
                            "upstream_error",
                            message,
                            "unrecognized upstream failure",
                        ));
                    }
                }

                // Retryable outcome: head re-enqueue with per-service backoff.
                ctx.retry_count += 1;
                let backoff = retry_backoff(ctx.service, ctx.retry_count);
                info!(
                    event = "request_reenqueued",
                    trace_id = %ctx.trace_id,
                    family = %ctx.family,
                    retry = ctx.retry_count
                );
                drop(ticket);
                ticket = self.queues.reenqueue(ctx.family, backoff).await;
                continue;
            }

            // Success path.
            if let Some(fingerprints) = &ctx.fingerprints {
                self.pool.record_cache_usage(fingerprints, &credential.hash);
            }

            return match response.body {
                UpstreamResponseBody::Bytes(bytes) => {
                    let result = respond::handle_blocking_success(
                        ctx,
                        &self.counter,
                        status,
                        &response.headers,
                        &bytes,
                    )?;
                    ctx.changes.revert_all(&mut outbound);
                    self.events
                        .emit(emit_upstream(Some(status), Some(result.usage.clone()), None))
                        .await;
                    self.bill(ctx, &credential, &result.usage).await;
                    self.events
                        .emit(Event::Prompt(PromptEvent {
                            trace_id: ctx.trace_id.clone(),
                            at: SystemTime::now(),
                            model: ctx.model.clone(),
                            prompt_excerpt: excerpt(&outbound.body.prompt_text()),
                            completion_excerpt: result.completion_excerpt.clone(),
                        }))
                        .await;
                    for url in &result.image_urls {
                        self.events
                            .emit(Event::Image(crate::events::ImageEvent {
                                trace_id: ctx.trace_id.clone(),
                                at: SystemTime::now(),
                                model: ctx.model.clone(),
                                url: Some(url.clone()),
                                bytes_base64: None,
                            }))
                            .await;
                    }
                    drop(ticket);
                    Ok(result.client)
                }
                UpstreamResponseBody::Stream(stream) => {
                    let (client, aggregate_rx) =
                        respond::handle_stream_success(ctx, status, &response.headers, stream);
                    ctx.changes.revert_all(&mut outbound);

                    // Billing completes when the stream does, whether or not
                    // the client is still connected.
                    let engine = self.clone();
                    let billing_ctx = BillingContext::from_ctx(ctx, &credential);
                    let upstream_event = emit_upstream(Some(status), None, None);
                    tokio::spawn(async move {
                        let _ticket = ticket;
                        engine.events.emit(upstream_event).await;
                        let Ok(aggregate) = aggregate_rx.await else {
                            warn!(
                                event = "stream_aggregate_lost",
                                trace_id = %billing_ctx.trace_id
                            );
                            return;
                        };
                        engine.finish_stream_billing(billing_ctx, aggregate).await;
                    });
                    Ok(client)
                }
            };
        }
    }

    async fn resolve_gcp_token(
        &self,
        credential: &Credential,
    ) -> Result<Option<String>, RequestError> {
        if credential.service != Service::Gcp {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        if gcp::token_is_fresh(credential, now)
            && let CredentialKind::Gcp { access_token, .. } = &credential.kind
        {
            return Ok(Some(access_token.clone()));
        }
        let token = gcp::refresh_access_token(&self.oauth_client, credential, now)
            .await
            .map_err(|err| RequestError::internal(format!("gcp oauth: {err}")))?;
        if let CredentialKind::Gcp {
            region,
            project_id,
            client_email,
            private_key,
            ..
        } = &credential.kind
        {
            self.pool
                .update(
                    &credential.hash,
                    mproxy_pool::CredentialPatch {
                        kind: Some(CredentialKind::Gcp {
                            region: region.clone(),
                            project_id: project_id.clone(),
                            client_email: client_email.clone(),
                            private_key: private_key.clone(),
                            access_token: token.access_token.clone(),
                            token_expires_at: token.expires_at,
                        }),
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok(Some(token.access_token))
    }

    async fn bill(&self, ctx: &RequestContext, credential: &Credential, usage: &UsageSummary) {
        let (input, output) = respond::billing_delta(usage);
        self.pool
            .increment_usage(&credential.hash, ctx.family, UsageDelta { input, output })
            .await;
        if let Some(token) = ctx.user_token.as_deref() {
            // Swap the provisional admission charge for the authoritative one.
            self.users
                .refund_token_count(token, ctx.family, ctx.prompt_tokens)
                .await;
            self.users
                .increment_token_count(token, ctx.family, input, output)
                .await;
        }
        self.maybe_recheck_balance(credential);
    }

    /// Paid OpenRouter balances drift with every request; refresh them on a
    /// prompt-count cadence so selection keeps sorting by real money.
    fn maybe_recheck_balance(&self, credential: &Credential) {
        let is_paid_openrouter = matches!(
            credential.kind,
            CredentialKind::Openrouter {
                is_free_tier: false,
                ..
            }
        );
        if !is_paid_openrouter
            || credential.prompt_count == 0
            || credential.prompt_count % OPENROUTER_BALANCE_RECHECK_EVERY != 0
        {
            return;
        }
        if let Some(checker) = &self.checker {
            let checker = checker.clone();
            let hash = credential.hash.clone();
            tokio::spawn(async move {
                checker.check_one(&hash).await;
            });
        }
    }

    async fn finish_stream_billing(
        &self,
        billing: BillingContext,
        aggregate: mproxy_transform::AggregatedStream,
    ) {
        let usage = {
            // Rebuild the minimum context the usage resolver needs.
            let mut usage = aggregate.usage.clone();
            if usage.input_tokens.is_none() {
                usage.input_tokens = Some(billing.prompt_tokens);
            }
            if usage.output_tokens.is_none() {
                let (count, _) =
                    self.counter
                        .count_text(billing.service, billing.family, &aggregate.content);
                usage.output_tokens = Some(count);
            }
            usage
        };
        let (input, output) = respond::billing_delta(&usage);
        self.pool
            .increment_usage(
                &billing.credential_hash,
                billing.family,
                UsageDelta { input, output },
            )
            .await;
        if let Some(token) = billing.user_token.as_deref() {
            self.users
                .refund_token_count(token, billing.family, billing.prompt_tokens)
                .await;
            self.users
                .increment_token_count(token, billing.family, input, output)
                .await;
        }
        self.events
            .emit(Event::Upstream(UpstreamEvent {
                trace_id: billing.trace_id.clone(),
                at: SystemTime::now(),
                service: billing.service,
                credential_hash: billing.credential_hash.clone(),
                attempt: billing.attempt,
                status: Some(200),
                usage: Some(usage),
                error: None,
            }))
            .await;
    }
}

/// The slice of request state a detached stream-billing task needs.
struct BillingContext {
    trace_id: String,
    service: Service,
    family: ModelFamily,
    credential_hash: String,
    user_token: Option<String>,
    prompt_tokens: u64,
    attempt: u32,
}

impl BillingContext {
    fn from_ctx(ctx: &RequestContext, credential: &Credential) -> Self {
        Self {
            trace_id: ctx.trace_id.clone(),
            service: ctx.service,
            family: ctx.family,
            credential_hash: credential.hash.clone(),
            user_token: ctx.user_token.clone(),
            prompt_tokens: ctx.prompt_tokens,
            attempt: ctx.retry_count + 1,
        }
    }
}

// ---- Stage A helpers -------------------------------------------------------

fn parse_body(inbound: &InboundRequest) -> Result<RequestBody, RequestError> {
    let bytes = &inbound.raw_body;
    if bytes.is_empty() {
        return Err(RequestError::bad_request("missing request body"));
    }
    let parse_err =
        |err: serde_json::Error| RequestError::bad_request(format!("invalid request: {err}"));
    Ok(match inbound.op {
        RouteOp::ChatCompletions => {
            RequestBody::Openai(serde_json::from_slice(bytes).map_err(parse_err)?)
        }
        RouteOp::Messages => {
            RequestBody::AnthropicChat(serde_json::from_slice(bytes).map_err(parse_err)?)
        }
        RouteOp::Complete => {
            RequestBody::AnthropicText(serde_json::from_slice(bytes).map_err(parse_err)?)
        }
        RouteOp::Embeddings => {
            RequestBody::Embeddings(serde_json::from_slice(bytes).map_err(parse_err)?)
        }
        RouteOp::ImageGenerations => {
            RequestBody::OpenaiImage(serde_json::from_slice(bytes).map_err(parse_err)?)
        }
        RouteOp::GenerateContent => {
            RequestBody::GoogleAi(serde_json::from_slice(bytes).map_err(parse_err)?)
        }
    })
}

fn extract_model(body: &RequestBody, from_path: Option<&str>) -> Option<String> {
    if let Some(model) = from_path {
        return Some(model.to_string());
    }
    match body {
        RequestBody::Openai(request) => Some(request.model.clone()),
        RequestBody::OpenaiResponses(request) => Some(request.model.clone()),
        RequestBody::OpenaiImage(request) => Some(request.model.clone()),
        RequestBody::Embeddings(request) => Some(request.model.clone()),
        RequestBody::AnthropicChat(request) => Some(request.model.clone()),
        RequestBody::AnthropicText(request) => Some(request.model.clone()),
        RequestBody::GoogleAi(_) => None,
        RequestBody::MistralAi(request) => Some(request.model.clone()),
    }
}

fn set_model(body: &mut RequestBody, model: &str) {
    match body {
        RequestBody::Openai(request) => request.model = model.to_string(),
        RequestBody::OpenaiResponses(request) => request.model = model.to_string(),
        RequestBody::OpenaiImage(request) => request.model = model.to_string(),
        RequestBody::Embeddings(request) => request.model = model.to_string(),
        RequestBody::AnthropicChat(request) => request.model = model.to_string(),
        RequestBody::AnthropicText(request) => request.model = model.to_string(),
        RequestBody::GoogleAi(_) => {}
        RequestBody::MistralAi(request) => request.model = model.to_string(),
    }
}

/// Which dialect the upstream speaks for this request.
fn outbound_format(service: Service, family: ModelFamily, op: RouteOp, model: &str) -> ApiFormat {
    match service {
        Service::Anthropic => match op {
            // Claude 3+ no longer serves /v1/complete; translate up.
            RouteOp::Complete if is_legacy_claude(model) => ApiFormat::AnthropicText,
            _ => ApiFormat::AnthropicChat,
        },
        Service::Aws => {
            if family == ModelFamily::AwsMistral {
                ApiFormat::MistralAi
            } else if is_legacy_claude(model) && op == RouteOp::Complete {
                ApiFormat::AnthropicText
            } else {
                ApiFormat::AnthropicChat
            }
        }
        Service::Gcp => ApiFormat::AnthropicChat,
        Service::GoogleAi => ApiFormat::GoogleAi,
        Service::MistralAi => ApiFormat::MistralAi,
        Service::Openai | Service::Azure => match op {
            RouteOp::ImageGenerations => ApiFormat::OpenaiImage,
            _ if family == ModelFamily::Gpt5 && service == Service::Openai => {
                ApiFormat::OpenaiResponses
            }
            _ => ApiFormat::Openai,
        },
        _ => ApiFormat::Openai,
    }
}

fn is_legacy_claude(model: &str) -> bool {
    let bare = model.strip_prefix("anthropic.").unwrap_or(model);
    bare.starts_with("claude-v")
        || bare.starts_with("claude-instant")
        || bare.starts_with("claude-1")
        || bare.starts_with("claude-2")
}

/// Stage A step 3: provider quirks applied before counting and admission.
fn touch_up(ctx: &mut RequestContext, body: &mut RequestBody) -> Result<(), RequestError> {
    // Mistral accepts an assistant-last conversation only as a prefix
    // continuation.
    if let RequestBody::MistralAi(chat) = body
        && let Some(last) = chat.messages.last_mut()
        && last.role == "assistant"
        && last.prefix.is_none()
        && last.tool_calls.is_none()
    {
        last.prefix = Some(true);
    }

    if let RequestBody::AnthropicChat(chat) = body {
        // Claude 4.1 Opus rejects simultaneous non-default temperature and
        // top_p.
        if ctx.model.contains("opus-4-1")
            && chat.temperature.map(|t| t != 1.0).unwrap_or(false)
            && chat.top_p.map(|p| p != 1.0).unwrap_or(false)
        {
            return Err(RequestError::bad_request(
                "temperature and top_p cannot both be non-default for this model",
            )
            .with_model(&ctx.model));
        }

        // Sonnet 3.5's >4096 output window sits behind a beta flag.
        if chat.max_tokens > 4096 && ctx.model.contains("3-5-sonnet") {
            push_unique(&mut ctx.anthropic_beta, "max-tokens-3-5-sonnet-2024-07-15");
        }

        // Opt-in web search tool for models that support it.
        if chat.extra.remove("web_search").map(|v| v == serde_json::Value::Bool(true)).unwrap_or(false)
            && supports_web_search(&ctx.model)
        {
            let mut extra = serde_json::Map::new();
            extra.insert("type".to_string(), json!("web_search_20250305"));
            extra.insert("max_uses".to_string(), json!(5));
            let tool = Tool {
                name: "web_search".to_string(),
                description: None,
                input_schema: None,
                cache_control: None,
                extra,
            };
            chat.tools.get_or_insert_with(Vec::new).push(tool);
        }
    }

    if let RequestBody::AnthropicText(text) = body
        && text.max_tokens_to_sample > 4096
        && ctx.model.contains("3-5-sonnet")
    {
        push_unique(&mut ctx.anthropic_beta, "max-tokens-3-5-sonnet-2024-07-15");
    }

    Ok(())
}

fn supports_web_search(model: &str) -> bool {
    model.contains("claude-3-7")
        || model.contains("sonnet-4")
        || model.contains("opus-4")
        || model.contains("haiku-4")
}

/// Streaming policy: image families cannot stream; o1 predates streaming;
/// gpt-5-pro only answers over the streaming surface.
fn streaming_allowed(family: ModelFamily, model: &str) -> Result<(), RequestError> {
    if !family.supports_streaming() || family == ModelFamily::O1 {
        return Err(
            RequestError::bad_request("this model does not support streaming").with_model(model),
        );
    }
    Ok(())
}

/// Blocking policy for models that must stream.
pub fn must_stream(model: &str) -> bool {
    model.starts_with("gpt-5-pro")
}

fn placeholder_body() -> mproxy_protocol::openai::chat::ChatCompletionRequest {
    mproxy_protocol::openai::chat::ChatCompletionRequest {
        model: String::new(),
        messages: Vec::new(),
        max_tokens: None,
        max_completion_tokens: None,
        temperature: None,
        top_p: None,
        n: None,
        stop: None,
        stream: None,
        stream_options: None,
        user: None,
        tools: None,
        tool_choice: None,
        logit_bias: None,
        extra: serde_json::Map::new(),
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(512).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_claude_detection() {
        assert!(is_legacy_claude("claude-2.1"));
        assert!(is_legacy_claude("anthropic.claude-v2:1"));
        assert!(is_legacy_claude("claude-instant-1.2"));
        assert!(!is_legacy_claude("claude-3-5-sonnet-20241022"));
        assert!(!is_legacy_claude("claude-sonnet-4-20250514"));
    }

    #[test]
    fn gpt5_routes_to_responses() {
        assert_eq!(
            outbound_format(
                Service::Openai,
                ModelFamily::Gpt5,
                RouteOp::ChatCompletions,
                "gpt-5"
            ),
            ApiFormat::OpenaiResponses
        );
        assert_eq!(
            outbound_format(
                Service::Openai,
                ModelFamily::Gpt4o,
                RouteOp::ChatCompletions,
                "gpt-4o"
            ),
            ApiFormat::Openai
        );
    }

    #[test]
    fn streaming_policy_rejects_o1_and_images() {
        assert!(streaming_allowed(ModelFamily::O1, "o1").is_err());
        assert!(streaming_allowed(ModelFamily::DallE, "dall-e-3").is_err());
        assert!(streaming_allowed(ModelFamily::Claude, "claude-3-5-sonnet-20241022").is_ok());
    }
}
