//! The request pipeline and everything it owns: the per-family queue, the
//! change manager, outbound mutation, upstream dispatch, response handling,
//! error classification and usage accounting.

pub mod change;
pub mod classify;
pub mod context;
pub mod events;
pub mod models_cache;
pub mod mutate;
pub mod pipeline;
pub mod queue;
pub mod respond;
pub mod tokens;
pub mod upstream;

pub use change::{ChangeManager, OutboundRequest};
pub use classify::{ErrorClass, classify_upstream_error};
pub use context::{ClientResponse, InboundRequest, RequestContext, RequestError, RouteOp};
pub use events::{Event, EventHub, EventSink, TracingSink};
pub use pipeline::{Engine, EngineConfig};
pub use queue::{QueueSet, QueueTicket};
pub use upstream::{
    UpstreamClient, UpstreamClientConfig, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamResponseBody, UpstreamTransportErrorKind, WreqUpstreamClient,
};
