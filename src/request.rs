//! Request and response model
//!
//! Requests and responses carry an [`http::Extensions`] map of attachments:
//! typed values that travel alongside the payload without being sent on the
//! wire. The routing layer uses two of them:
//!
//! - [`RoutingKey`] on requests partitions the fair queue
//! - [`StickyTarget`] on responses names the host that served them, and on
//!   requests forces routing to that host

use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, StatusCode};
use std::fmt;
use std::sync::Arc;

use crate::channel::HostInfo;

/// Identifies the remote operation a request invokes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    service_name: Arc<str>,
    endpoint_name: Arc<str>,
    method: Method,
}

impl Endpoint {
    pub fn new(
        service_name: impl Into<Arc<str>>,
        endpoint_name: impl Into<Arc<str>>,
        method: Method,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint_name: endpoint_name.into(),
            method,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_name, self.endpoint_name)
    }
}

/// Outgoing request
#[derive(Debug, Default)]
pub struct Request {
    headers: HeaderMap,
    body: Bytes,
    attachments: Extensions,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Attach a fair-queue routing key
    pub fn with_routing_key(mut self, key: RoutingKey) -> Self {
        self.attachments.insert(key);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn attachments(&self) -> &Extensions {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Extensions {
        &mut self.attachments
    }

    pub fn routing_key(&self) -> Option<&RoutingKey> {
        self.attachments.get::<RoutingKey>()
    }

    pub fn sticky_target(&self) -> Option<&StickyTarget> {
        self.attachments.get::<StickyTarget>()
    }
}

/// Response produced by a transport
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    attachments: Extensions,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            attachments: Extensions::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn attachments(&self) -> &Extensions {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Extensions {
        &mut self.attachments
    }

    pub fn sticky_target(&self) -> Option<&StickyTarget> {
        self.attachments.get::<StickyTarget>()
    }
}

/// Fair-queue partition for a request.
///
/// Requests sharing a key are served FIFO; distinct keys are served
/// round-robin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(Arc<str>);

impl RoutingKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host that served a response, or that a request must be routed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StickyTarget {
    host: HostInfo,
}

impl StickyTarget {
    pub fn new(host: HostInfo) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn uri(&self) -> &str {
        self.host.uri()
    }
}
