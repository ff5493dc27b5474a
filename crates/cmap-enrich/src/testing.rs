//! Scripted HTTP transport for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cmap_storage::{FetchError, FetchedResponse, HttpRequest, HttpTransport, StatusCode};

type Handler = Box<dyn Fn(&HttpRequest) -> Result<FetchedResponse, FetchError> + Send + Sync>;

pub struct FakeTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<FetchedResponse, FetchError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Replies in order; fails once the script runs out.
    pub fn sequence(replies: Vec<Result<FetchedResponse, FetchError>>) -> Arc<Self> {
        let replies = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transport("script exhausted".into())))
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count_to(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

pub fn json(status: u16, body: &str) -> FetchedResponse {
    FetchedResponse {
        status: StatusCode::from_u16(status).unwrap(),
        final_url: "https://fake.test".into(),
        body: body.as_bytes().to_vec(),
    }
}

pub fn place_body(address: &str, mapx: &str, mapy: &str, category: &str) -> FetchedResponse {
    let body = serde_json::json!({
        "lastBuildDate": "Mon, 19 Oct 2026 10:00:00 +0900",
        "total": 1,
        "items": [{
            "title": "<b>가게</b>",
            "category": category,
            "address": "",
            "roadAddress": address,
            "mapx": mapx,
            "mapy": mapy,
        }]
    });
    json(200, &body.to_string())
}

pub fn geocode_body(lat: f64, lng: f64) -> FetchedResponse {
    let body = serde_json::json!({
        "status": "OK",
        "addresses": [{ "roadAddress": "", "x": lng.to_string(), "y": lat.to_string() }]
    });
    json(200, &body.to_string())
}
