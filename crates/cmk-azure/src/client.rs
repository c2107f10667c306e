//! HTTP client wrapper for the Azure management and Graph APIs.
//!
//! Handles bearer-token injection, the 429 cool-off schedule, tracking of the
//! remaining-reads quota, `error` body mapping and pagination via `nextLink`
//! (or `@odata.nextLink` for Graph). The wire is abstracted behind
//! [`Transport`] so the request logic can run against a scripted transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderName, HeaderValue};
pub use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::{self, AuthorityUrls};
use crate::types::{AzureError, AzureErrorKind, AzureResult, AzureToken, Credentials, ProxyConfig};

/// Remaining-reads header reported by the management API.
pub const RATELIMIT_HEADER: &str = "x-ms-ratelimit-remaining-subscription-reads";
/// Client type announced on every request unless overridden per call.
pub const DEFAULT_CLIENT_TYPE: &str = "monitoring-custom-client-type";
/// Cool-off delays applied while the API keeps answering 429.
const COOL_OFF_SECS: [u64; 2] = [5, 10];

// ─── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A fully resolved request as handed to the transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Status, lower-cased headers and the decoded body of a response.
///
/// Bodies that are not JSON are kept as a JSON string; empty bodies are `null`.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl ApiResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }
}

/// Sends one request. Implementations do not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> AzureResult<ApiResponse>;
}

// ─── reqwest transport ───────────────────────────────────────────────

/// Production transport on top of `reqwest`.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(proxy: &ProxyConfig, timeout: Duration) -> AzureResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        builder = match proxy {
            ProxyConfig::FromEnvironment => builder,
            ProxyConfig::NoProxy => builder.no_proxy(),
            ProxyConfig::Url(url) => builder.proxy(
                reqwest::Proxy::all(url)
                    .map_err(|e| AzureError::config(format!("invalid proxy {url}: {e}")))?,
            ),
        };
        let http = builder
            .build()
            .map_err(|e| AzureError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> AzureResult<ApiResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .query(&request.query);

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AzureError::config(format!("Header name error: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AzureError::config(format!("Header value error: {e}")))?;
            builder = builder.header(name, value);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(form) => builder.form(form),
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_lowercase(), v.to_str().ok()?.to_string())))
            .collect();
        let text = resp.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

// ─── Rate limit ──────────────────────────────────────────────────────

/// Minimum remaining-reads value observed across all responses.
#[derive(Debug)]
pub struct RateLimit(AtomicU64);

impl RateLimit {
    pub fn new() -> Self {
        Self(AtomicU64::new(u64::MAX))
    }

    pub fn observe(&self, remaining: u64) {
        self.0.fetch_min(remaining, Ordering::Relaxed);
    }

    pub fn observe_headers(&self, headers: &BTreeMap<String, String>) {
        if let Some(remaining) = headers
            .get(RATELIMIT_HEADER)
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.observe(remaining);
        }
    }

    /// `None` until a response carried the header.
    pub fn remaining(&self) -> Option<u64> {
        match self.0.load(Ordering::Relaxed) {
            u64::MAX => None,
            v => Some(v),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Call description ────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum CallTarget {
    /// Relative to the base URL of the client.
    UriEnd(String),
    /// Already fully qualified (pagination links, regional endpoints).
    FullUri(String),
}

/// One logical API call, possibly spanning several pages.
#[derive(Debug, Clone)]
pub struct ApiCall {
    method: Method,
    target: CallTarget,
    query: Vec<(String, String)>,
    body: Option<Value>,
    key: Option<String>,
    next_page_key: String,
    headers: Vec<(String, String)>,
    raise_for_rate_limit: bool,
}

impl ApiCall {
    fn new(method: Method, target: CallTarget) -> Self {
        Self {
            method,
            target,
            query: Vec::new(),
            body: None,
            key: None,
            next_page_key: "nextLink".into(),
            headers: Vec::new(),
            raise_for_rate_limit: false,
        }
    }

    pub fn get(uri_end: impl Into<String>) -> Self {
        Self::new(Method::GET, CallTarget::UriEnd(uri_end.into()))
    }

    pub fn post(uri_end: impl Into<String>) -> Self {
        Self::new(Method::POST, CallTarget::UriEnd(uri_end.into()))
    }

    pub fn full_uri(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, CallTarget::FullUri(url.into()))
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.query.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.query.push((name, value)),
        }
        self
    }

    pub fn api_version(self, version: &str) -> Self {
        self.param("api-version", version)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Return only this member of the response, concatenating pages.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn next_page_key(mut self, key: impl Into<String>) -> Self {
        self.next_page_key = key.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Surface a 429 that outlives the cool-off schedule as a `RateLimit` error.
    pub fn raise_for_rate_limit(mut self) -> Self {
        self.raise_for_rate_limit = true;
        self
    }
}

// ─── Client ──────────────────────────────────────────────────────────

/// Authenticated client for one API surface (management or Graph).
pub struct AzureClient {
    transport: Arc<dyn Transport>,
    urls: AuthorityUrls,
    token: Option<AzureToken>,
    ratelimit: RateLimit,
}

impl AzureClient {
    pub fn new(transport: Arc<dyn Transport>, urls: AuthorityUrls) -> Self {
        Self {
            transport,
            urls,
            token: None,
            ratelimit: RateLimit::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn urls(&self) -> &AuthorityUrls {
        &self.urls
    }

    pub fn set_token(&mut self, token: AzureToken) {
        self.token = Some(token);
    }

    pub fn is_authenticated(&self) -> bool {
        self.token
            .as_ref()
            .map(|t| !t.access_token.is_empty() && !t.is_expired())
            .unwrap_or(false)
    }

    /// Lowest remaining-reads value seen so far.
    pub fn ratelimit(&self) -> Option<u64> {
        self.ratelimit.remaining()
    }

    pub fn regional_url(&self, region: &str, suffix: &str) -> AzureResult<String> {
        self.urls.regional_url(region, suffix)
    }

    // ── Login ────────────────────────────────────────────────────────

    pub async fn login(&mut self, creds: &Credentials) -> AzureResult<()> {
        let token = auth::acquire_token(self.transport.as_ref(), &self.urls, creds).await?;
        self.token = Some(token);
        Ok(())
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Execute `call`. With a key set, the member under that key is returned
    /// and list members are concatenated across all continuation pages.
    pub async fn request(&self, call: ApiCall) -> AzureResult<Value> {
        let url = match &call.target {
            CallTarget::UriEnd(uri_end) => {
                format!("{}{}", self.urls.base, uri_end.trim_start_matches('/'))
            }
            CallTarget::FullUri(url) => url.clone(),
        };

        let mut json = self.fetch_json(&call, &url, &call.query).await?;
        let Some(key) = call.key.as_deref() else {
            return Ok(json);
        };

        let mut next_link = next_link(&json, &call.next_page_key);
        let data = take_key(&mut json, key)?;
        let Value::Array(mut items) = data else {
            return Ok(data);
        };

        while let Some(link) = next_link {
            debug!("request: following {} → {}", call.next_page_key, link);
            let mut page = self.fetch_json(&call, &link, &[]).await?;
            next_link = self::next_link(&page, &call.next_page_key);
            match take_key(&mut page, key)? {
                Value::Array(more) => items.extend(more),
                other => {
                    return Err(AzureError::api(format!(
                        "unexpected page content for {key}: {other}"
                    )))
                }
            }
        }

        Ok(Value::Array(items))
    }

    /// Like [`request`](Self::request), deserialising the result.
    pub async fn request_as<T: DeserializeOwned>(&self, call: ApiCall) -> AzureResult<T> {
        let value = self.request(call).await?;
        serde_json::from_value(value)
            .map_err(|e| AzureError::new(AzureErrorKind::Parse, format!("JSON parse: {e}")))
    }

    async fn fetch_json(
        &self,
        call: &ApiCall,
        url: &str,
        query: &[(String, String)],
    ) -> AzureResult<Value> {
        let request = ApiRequest {
            method: call.method.clone(),
            url: url.to_string(),
            query: query.to_vec(),
            headers: self.headers(&call.headers)?,
            body: match &call.body {
                Some(body) => RequestBody::Json(body.clone()),
                None => RequestBody::Empty,
            },
        };

        let response = self.send_with_cool_off(&request).await?;
        if response.status == 429 && call.raise_for_rate_limit {
            return Err(AzureError::rate_limited(response.status, response.headers));
        }

        if let Some(error) = response.body.get("error") {
            return Err(AzureError::from_error_body(error));
        }
        Ok(response.body)
    }

    async fn send_with_cool_off(&self, request: &ApiRequest) -> AzureResult<ApiResponse> {
        let mut response = self.transport.send(request).await?;
        self.ratelimit.observe_headers(&response.headers);

        for delay in COOL_OFF_SECS {
            if response.status != 429 {
                break;
            }
            warn!(
                "Azure {} {} → 429, rate limit exceeded, waiting {}s",
                request.method, request.url, delay
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
            response = self.transport.send(request).await?;
            self.ratelimit.observe_headers(&response.headers);
        }

        Ok(response)
    }

    fn headers(&self, extra: &[(String, String)]) -> AzureResult<Vec<(String, String)>> {
        let token = self
            .token
            .as_ref()
            .filter(|t| !t.access_token.is_empty())
            .ok_or_else(AzureError::not_authenticated)?;

        let mut headers: Vec<(String, String)> = vec![
            ("Authorization".into(), format!("Bearer {}", token.access_token)),
            ("Content-Type".into(), "application/json".into()),
            ("ClientType".into(), DEFAULT_CLIENT_TYPE.into()),
        ];
        for (name, value) in extra {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }
        Ok(headers)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn next_link(json: &Value, next_page_key: &str) -> Option<String> {
    json.get(next_page_key)
        .and_then(Value::as_str)
        .filter(|link| !link.is_empty())
        .map(str::to_string)
}

/// Remove `key` from an object body; a missing key is an API error
/// carrying the whole body.
fn take_key(json: &mut Value, key: &str) -> AzureResult<Value> {
    match json.as_object_mut().and_then(|obj| obj.remove(key)) {
        Some(value) => Ok(value),
        None => Err(AzureError::api(json.to_string())),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
