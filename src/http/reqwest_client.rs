use reqwest::blocking::{Client as BlockingClient, ClientBuilder};

use crate::error::Error;
use crate::http::{Client, Method, Request, Response, ResponseData};

/// The production `Client`: a blocking `reqwest` client with rustls-tls.
/// Backend auth (mutual TLS, device certificates) is handled one layer
/// up by whoever builds the request's headers, not by this transport.
pub struct ReqwestClient {
    inner: BlockingClient,
}

impl ReqwestClient {
    pub fn new() -> Result<ReqwestClient, Error> {
        let inner = ClientBuilder::new()
            .build()
            .map_err(Error::from)?;
        Ok(ReqwestClient { inner })
    }
}

impl Client for ReqwestClient {
    fn execute(&self, req: Request) -> Response {
        let builder = match req.method {
            Method::Get => self.inner.get(req.url),
            Method::Put => self.inner.put(req.url),
            Method::Post => self.inner.post(req.url),
        };
        let builder = builder.timeout(req.timeout);
        let builder = match req.body {
            Some(body) => builder.body(body),
            None => builder,
        };
        let response = builder.send().map_err(Error::from)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(Error::from)?.to_vec();
        Ok(ResponseData { status, body })
    }
}
