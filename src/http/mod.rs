//! The HTTP collaborator: a blocking request/response abstraction the
//! core consumes but never implements directly. A blocking `reqwest`
//! client backs production use; the engine thread model already treats
//! HTTP as blocking-with-deadline from its own perspective, so there's
//! no async runtime to thread through the rest of the crate.

mod reqwest_client;
mod test_client;

pub use reqwest_client::ReqwestClient;
pub use test_client::TestClient;

use std::time::Duration;

use url::Url;

use crate::error::Error;

/// The supported HTTP methods, trimmed to what the backend endpoints
/// actually need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

/// An outgoing request. `body` is `None` for `Get`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Request {
    pub fn get(url: Url, timeout: Duration) -> Request {
        Request { method: Method::Get, url, body: None, timeout }
    }

    pub fn put(url: Url, body: Vec<u8>, timeout: Duration) -> Request {
        Request { method: Method::Put, url, body: Some(body), timeout }
    }

    pub fn post(url: Url, body: Vec<u8>, timeout: Duration) -> Request {
        Request { method: Method::Post, url, body: Some(body), timeout }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ResponseData {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Every collaborator call returns either a response (even a non-2xx
/// one, so callers can inspect status) or a hard transport failure.
pub type Response = Result<ResponseData, Error>;

/// What the core needs from an HTTP transport: execute a request and
/// return its outcome, with the caller's deadline already attached.
pub trait Client: Send + Sync {
    fn execute(&self, req: Request) -> Response;

    /// Whether this client is a test double; used to relax TLS/auth
    /// requirements that only make sense against a real backend.
    fn is_testing(&self) -> bool {
        false
    }
}
