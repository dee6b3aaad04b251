use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::routing::{any, get};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use mproxy_common::new_trace_id;
use mproxy_core::{ClientResponse, Engine, InboundRequest, RequestError};
use mproxy_registry::{ModelFamily, Service};
use mproxy_users::AuthOutcome;

use crate::classify_route::{Route, classify_route};

const REQUEST_ID_HEADER: &str = "x-mproxy-request-id";

#[derive(Clone)]
pub struct RouterState {
    engine: Arc<Engine>,
    /// Shared-secret mode: this value authenticates without a user record
    /// (no quota tracking attaches to it).
    proxy_password: Option<String>,
}

pub fn proxy_router(engine: Arc<Engine>, proxy_password: Option<String>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/{service}/{*path}", any(proxy_handler))
        .with_state(RouterState {
            engine,
            proxy_password,
        })
}

async fn health_handler(State(state): State<RouterState>) -> Response {
    let engine = &state.engine;
    let mut families = Vec::new();
    for family in ModelFamily::all() {
        if engine.pool().candidate_count(*family).await > 0 {
            families.push(engine.family_status(*family).await);
        }
    }
    let body = serde_json::json!({
        "status": "ok",
        "users": engine.users().count().await,
        "families": families,
    });
    json_response(200, Bytes::from(body.to_string()), None)
}

async fn proxy_handler(
    State(state): State<RouterState>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let engine = &state.engine;
    let Some(service) = Service::parse(&service) else {
        return error_response(&RequestError::new(
            404,
            "not_found",
            format!("unknown service prefix: {service}"),
            "mount point does not exist",
        ));
    };
    let trace_id = new_trace_id();

    let route = match classify_route(&method, &path, uri.query()) {
        Ok(route) => route,
        Err(err) => {
            return error_response(&RequestError::new(
                err.status,
                "invalid_request_error",
                err.message,
                "rejected by the front door",
            ));
        }
    };

    if let Route::ModelsList = route {
        let list = engine.list_models(service).await;
        let body = serde_json::to_vec(&list).unwrap_or_default();
        return json_response(200, Bytes::from(body), Some(&trace_id));
    }

    // Inbound user authentication: bearer token against the user store, with
    // IP tracking. The proxy password short-circuits as an untracked
    // authentication; an empty store runs open (no tokens issued yet).
    let user_token = match authenticate(&state, &headers).await {
        Ok(token) => token,
        Err(err) => return error_response(&err),
    };

    let Route::Call {
        op,
        inbound_format,
        model_from_path,
        stream_from_path,
    } = route
    else {
        return error_response(&RequestError::internal("unreachable route"));
    };

    info!(
        event = "request_received",
        trace_id = %trace_id,
        service = %service,
        path = %path,
        method = %method
    );

    let inbound = InboundRequest {
        trace_id: trace_id.clone(),
        service,
        inbound_format,
        op,
        raw_body: body,
        model_from_path,
        stream_from_path,
        user_token,
        ip: client_ip(&headers),
        user_agent: header_string(&headers, "user-agent"),
    };

    match engine.handle(inbound).await {
        Ok(ClientResponse::Json {
            status,
            headers,
            body,
        }) => {
            let mut resp = json_response(status, body, Some(&trace_id));
            extend_headers(&mut resp, &headers);
            resp
        }
        Ok(ClientResponse::Stream {
            status,
            headers,
            content_type,
            body,
        }) => {
            let stream = ReceiverStream::new(body).map(Ok::<Bytes, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            extend_headers(&mut resp, &headers);
            if !resp.headers().contains_key("content-type")
                && let Ok(value) = HeaderValue::from_str(content_type)
            {
                resp.headers_mut().insert("content-type", value);
            }
            if let Ok(value) = HeaderValue::from_str(&trace_id) {
                resp.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            resp
        }
        Err(err) => error_response(&err),
    }
}

/// Bearer token (or x-api-key) → user store. `Ok(None)` means the caller is
/// authenticated without a user record: the proxy password matched, or the
/// store is empty and the proxy runs open.
async fn authenticate(
    state: &RouterState,
    headers: &HeaderMap,
) -> Result<Option<String>, RequestError> {
    let engine = &state.engine;
    let token = extract_token(headers);
    if let (Some(password), Some(token)) = (&state.proxy_password, &token)
        && password == token
    {
        return Ok(None);
    }
    let Some(token) = token else {
        if engine.users().count().await == 0 {
            return Ok(None);
        }
        return Err(RequestError::unauthorized("missing user token"));
    };

    let ip = client_ip(headers);
    match engine.users().authenticate(&token, &ip).await {
        AuthOutcome::Success(_) => Ok(Some(token)),
        AuthOutcome::NotFound => Err(RequestError::unauthorized("unknown user token")),
        AuthOutcome::Disabled => Err(RequestError::new(
            403,
            "forbidden",
            "this token has been disabled",
            "token disabled",
        )),
        AuthOutcome::Limited => Err(RequestError::new(
            403,
            "forbidden",
            "too many IPs have used this token",
            "ip limit reached",
        )),
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_string(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_string(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn client_ip(headers: &HeaderMap) -> String {
    header_string(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header_string(headers, "x-real-ip"))
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn json_response(status: u16, body: Bytes, trace_id: Option<&str>) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    if let Some(trace_id) = trace_id
        && let Ok(value) = HeaderValue::from_str(trace_id)
    {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

fn error_response(err: &RequestError) -> Response {
    json_response(err.status, err.to_bytes(), None)
}

fn extend_headers(resp: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            resp.headers_mut().insert(name, value);
        }
    }
}
