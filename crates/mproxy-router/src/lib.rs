//! The front door: per-provider URL prefixes, inbound authentication and the
//! translation between axum and the pipeline's request/response types.

mod classify_route;
mod proxy;

pub use proxy::proxy_router;
