use std::cell::RefCell;

use crate::error::Error;
use crate::http::{Client, Request, Response, ResponseData};

/// Returns canned responses in order, one per call. Used by component
/// tests that drive the fetcher/verifier without a real backend.
pub struct TestClient {
    responses: RefCell<Vec<ResponseData>>,
}

impl Default for TestClient {
    fn default() -> TestClient {
        TestClient { responses: RefCell::new(Vec::new()) }
    }
}

impl TestClient {
    /// `responses` is consumed back-to-front; push in reverse order, or
    /// use `from_in_order` for the natural reading order.
    pub fn from(responses: Vec<ResponseData>) -> TestClient {
        TestClient { responses: RefCell::new(responses) }
    }

    pub fn from_in_order(mut responses: Vec<ResponseData>) -> TestClient {
        responses.reverse();
        TestClient { responses: RefCell::new(responses) }
    }

    pub fn ok(body: Vec<u8>) -> ResponseData {
        ResponseData { status: 200, body }
    }
}

impl Client for TestClient {
    fn execute(&self, req: Request) -> Response {
        self.responses
            .borrow_mut()
            .pop()
            .ok_or_else(|| Error::Network(format!("no more canned responses for {}", req.url)))
    }

    fn is_testing(&self) -> bool {
        true
    }
}
