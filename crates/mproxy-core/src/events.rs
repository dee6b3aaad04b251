use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use mproxy_registry::{ModelFamily, Service};
use mproxy_transform::UsageSummary;

/// Emitted once per downstream call and once per upstream attempt, plus
/// prompt/image records for external sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Downstream(DownstreamEvent),
    Upstream(UpstreamEvent),
    Prompt(PromptEvent),
    Image(ImageEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub service: Service,
    pub model: Option<String>,
    pub family: Option<ModelFamily>,
    pub user_token_hash: Option<String>,
    pub status: u16,
    pub is_stream: bool,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub service: Service,
    pub credential_hash: String,
    pub attempt: u32,
    pub status: Option<u16>,
    pub usage: Option<UsageSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub model: String,
    pub prompt_excerpt: String,
    pub completion_excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub model: String,
    pub url: Option<String>,
    pub bytes_base64: Option<String>,
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Broadcast hub plus fire-and-forget sinks. Sinks must never slow down the
/// request path; each write runs on its own task.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

/// Default sink: structured tracing lines.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                Event::Downstream(ev) => tracing::info!(
                    event = "downstream",
                    trace_id = %ev.trace_id,
                    service = %ev.service,
                    model = ?ev.model,
                    status = ev.status,
                    is_stream = ev.is_stream,
                    elapsed_ms = ev.elapsed_ms as u64
                ),
                Event::Upstream(ev) => tracing::info!(
                    event = "upstream",
                    trace_id = %ev.trace_id,
                    service = %ev.service,
                    credential = %ev.credential_hash,
                    attempt = ev.attempt,
                    status = ?ev.status,
                    error = ?ev.error
                ),
                Event::Prompt(ev) => tracing::debug!(
                    event = "prompt",
                    trace_id = %ev.trace_id,
                    model = %ev.model
                ),
                Event::Image(ev) => tracing::debug!(
                    event = "image",
                    trace_id = %ev.trace_id,
                    model = %ev.model
                ),
            }
        })
    }
}
