//! Scripted in-memory [`Transport`] for tests.
//!
//! Routes are matched by HTTP method and URL fragment; when several
//! fragments match, the longest wins. A route answers from its queue of
//! responses and keeps repeating the last one. Unrouted requests get a 404
//! with an ARM style `error` body.

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;

use crate::client::{ApiRequest, ApiResponse, Transport};
use crate::types::AzureResult;

struct Route {
    method: Method,
    fragment: String,
    responses: Vec<ApiResponse>,
    served: usize,
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer token requests with `access_token = "test-token"`.
    pub fn with_login(self) -> Self {
        self.on(
            Method::POST,
            "oauth2/v2.0/token",
            ApiResponse::json(
                200,
                json!({"access_token": "test-token", "token_type": "Bearer", "expires_in": 3599}),
            ),
        );
        self
    }

    pub fn on(&self, method: Method, fragment: &str, response: ApiResponse) -> &Self {
        self.on_sequence(method, fragment, vec![response])
    }

    pub fn on_sequence(&self, method: Method, fragment: &str, responses: Vec<ApiResponse>) -> &Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                method,
                fragment: fragment.to_string(),
                responses,
                served: 0,
            });
        }
        self
    }

    /// Every request sent so far, in order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Requests whose URL contains `fragment`.
    pub fn requests_to(&self, fragment: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }

    fn respond(&self, request: &ApiRequest) -> ApiResponse {
        let not_found = || {
            ApiResponse::json(
                404,
                json!({"error": {"code": "NotFound", "message": format!("no route for {} {}", request.method, request.url)}}),
            )
        };
        let Ok(mut routes) = self.routes.lock() else {
            return not_found();
        };
        let route = routes
            .iter_mut()
            .filter(|r| r.method == request.method && request.url.contains(&r.fragment))
            .fold(None::<&mut Route>, |best, r| match best {
                Some(b) if b.fragment.len() >= r.fragment.len() => Some(b),
                _ => Some(r),
            });
        match route {
            Some(route) if !route.responses.is_empty() => {
                let idx = route.served.min(route.responses.len() - 1);
                route.served += 1;
                route.responses[idx].clone()
            }
            _ => not_found(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> AzureResult<ApiResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        Ok(self.respond(request))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RequestBody;

    fn get(url: &str) -> ApiRequest {
        ApiRequest {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    #[tokio::test]
    async fn longest_fragment_wins() {
        let t = MockTransport::new();
        t.on(Method::GET, "/resources", ApiResponse::json(200, json!("short")));
        t.on(Method::GET, "/resourcegroups", ApiResponse::json(200, json!("long")));
        let resp = t.send(&get("https://x/subscriptions/s/resourcegroups")).await.unwrap();
        assert_eq!(resp.body, json!("long"));
    }

    #[tokio::test]
    async fn sequence_repeats_last_response() {
        let t = MockTransport::new();
        t.on_sequence(
            Method::GET,
            "x",
            vec![ApiResponse::json(429, json!({})), ApiResponse::json(200, json!({}))],
        );
        let statuses: Vec<u16> = futures::future::join_all((0..3).map(|_| async {
            t.send(&get("https://x")).await.unwrap().status
        }))
        .await;
        assert_eq!(statuses.iter().filter(|s| **s == 429).count(), 1);
        assert_eq!(t.requests().len(), 3);
    }

    #[tokio::test]
    async fn unrouted_request_is_not_found() {
        let t = MockTransport::new();
        let resp = t.send(&get("https://nowhere")).await.unwrap();
        assert_eq!(resp.status, 404);
        assert!(resp.body.get("error").is_some());
    }
}
