use bytes::Bytes;

use mproxy_transform::RequestBody;

/// The outgoing request under construction during stage B. Mutators edit it
/// through the `ChangeManager` so everything they did can be undone before
/// the post-dispatch logging stages run.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Set exactly once by `finalize_body`.
    pub serialized: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: &str, url: String, body: RequestBody) -> Self {
        Self {
            method: method.to_string(),
            url,
            headers: Vec::new(),
            body,
            serialized: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
enum Change {
    Header {
        name: String,
        previous: Option<String>,
    },
    Url {
        previous: String,
    },
    Body {
        previous: Box<RequestBody>,
    },
    Finalized,
}

/// Records reversible mutations applied to the outgoing request. `revert_all`
/// restores the request to its pre-mutation state exactly, so user-facing
/// logs reflect what the client originally sent.
#[derive(Debug, Default)]
pub struct ChangeManager {
    changes: Vec<Change>,
}

impl ChangeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&mut self, request: &mut OutboundRequest, name: &str, value: &str) {
        let previous = request
            .headers
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name));
        match previous {
            Some(index) => {
                let old = std::mem::replace(&mut request.headers[index].1, value.to_string());
                self.changes.push(Change::Header {
                    name: name.to_string(),
                    previous: Some(old),
                });
            }
            None => {
                request.headers.push((name.to_string(), value.to_string()));
                self.changes.push(Change::Header {
                    name: name.to_string(),
                    previous: None,
                });
            }
        }
    }

    pub fn set_url(&mut self, request: &mut OutboundRequest, url: String) {
        let previous = std::mem::replace(&mut request.url, url);
        self.changes.push(Change::Url { previous });
    }

    pub fn set_body(&mut self, request: &mut OutboundRequest, body: RequestBody) {
        let previous = std::mem::replace(&mut request.body, body);
        self.changes.push(Change::Body {
            previous: Box::new(previous),
        });
    }

    /// Serializes the body exactly once and records the content-length. A
    /// second call (after any number of no-op mutators) is a no-op.
    pub fn finalize_body(
        &mut self,
        request: &mut OutboundRequest,
    ) -> Result<(), serde_json::Error> {
        if request.serialized.is_some() {
            return Ok(());
        }
        let bytes = Bytes::from(request.body.to_json()?);
        self.set_header(request, "content-length", &bytes.len().to_string());
        self.set_header(request, "content-type", "application/json");
        request.serialized = Some(bytes);
        self.changes.push(Change::Finalized);
        Ok(())
    }

    /// Undoes every recorded change in reverse order.
    pub fn revert_all(&mut self, request: &mut OutboundRequest) {
        while let Some(change) = self.changes.pop() {
            match change {
                Change::Header { name, previous } => match previous {
                    Some(value) => {
                        if let Some(index) = request
                            .headers
                            .iter()
                            .position(|(key, _)| key.eq_ignore_ascii_case(&name))
                        {
                            request.headers[index].1 = value;
                        }
                    }
                    None => {
                        request
                            .headers
                            .retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
                    }
                },
                Change::Url { previous } => request.url = previous,
                Change::Body { previous } => request.body = *previous,
                Change::Finalized => request.serialized = None,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
