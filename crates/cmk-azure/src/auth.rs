//! Authority URL tables and Azure AD client-credentials login.
//!
//! The management and Graph APIs live behind different login, resource and
//! base URLs for the global and the China cloud. Everything downstream is
//! parameterised by an [`AuthorityUrls`] value.

use chrono::{Duration, Utc};
use log::debug;

use crate::client::{ApiRequest, RequestBody, Transport};
use crate::types::{AzureError, AzureResult, AzureToken, Authority, Credentials, TokenResponse};

const LOGIN_GLOBAL: &str = "https://login.microsoftonline.com";
const LOGIN_CHINA: &str = "https://login.partner.microsoftonline.cn";
const MGMT_GLOBAL: &str = "https://management.azure.com";
const MGMT_CHINA: &str = "https://management.chinacloudapi.cn";
const GRAPH_GLOBAL: &str = "https://graph.microsoft.com";
const GRAPH_CHINA: &str = "https://microsoftgraph.chinacloudapi.cn";

/// Placeholder substituted by [`AuthorityUrls::regional_url`].
const REGION_PLACEHOLDER: &str = "{region}";

/// Login, resource and base URLs of one API surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityUrls {
    pub login_base: String,
    pub resource: String,
    pub base: String,
    /// Regional metrics endpoint; `{region}` is replaced per request.
    pub regional: Option<String>,
}

impl AuthorityUrls {
    /// Regional endpoint for `region` with `suffix` appended.
    pub fn regional_url(&self, region: &str, suffix: &str) -> AzureResult<String> {
        let template = self
            .regional
            .as_deref()
            .ok_or_else(|| AzureError::config("Regional url not configured"))?;
        let base = template.replace(REGION_PLACEHOLDER, region);
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            suffix.trim_start_matches('/')
        ))
    }

    pub fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.login_base, tenant_id)
    }

    pub fn scope(&self) -> String {
        format!("{}/.default", self.resource)
    }
}

/// Management API URLs bound to `subscription`.
pub fn mgmt_authority_urls(authority: Authority, subscription: &str) -> AuthorityUrls {
    match authority {
        Authority::Global => AuthorityUrls {
            login_base: LOGIN_GLOBAL.into(),
            resource: MGMT_GLOBAL.into(),
            base: format!("{MGMT_GLOBAL}/subscriptions/{subscription}/"),
            regional: Some(format!(
                "https://{REGION_PLACEHOLDER}.metrics.monitor.azure.com/subscriptions/{subscription}"
            )),
        },
        Authority::China => AuthorityUrls {
            login_base: LOGIN_CHINA.into(),
            resource: MGMT_CHINA.into(),
            base: format!("{MGMT_CHINA}/subscriptions/{subscription}/"),
            regional: Some(format!(
                "https://metrics.monitor.azure.cn/subscriptions/{subscription}"
            )),
        },
    }
}

/// Microsoft Graph URLs.
pub fn graph_authority_urls(authority: Authority) -> AuthorityUrls {
    let (login, resource) = match authority {
        Authority::Global => (LOGIN_GLOBAL, GRAPH_GLOBAL),
        Authority::China => (LOGIN_CHINA, GRAPH_CHINA),
    };
    AuthorityUrls {
        login_base: login.into(),
        resource: resource.into(),
        base: format!("{resource}/v1.0/"),
        regional: None,
    }
}

/// Acquire a token using the client-credentials grant.
pub async fn acquire_token(
    transport: &dyn Transport,
    urls: &AuthorityUrls,
    creds: &Credentials,
) -> AzureResult<AzureToken> {
    if creds.client_id.is_empty() || creds.client_secret.is_empty() || creds.tenant_id.is_empty() {
        return Err(AzureError::login_failed(
            "client_id, client_secret, and tenant_id are all required",
        ));
    }

    let url = urls.token_url(&creds.tenant_id);
    debug!("acquire_token({}) → {}", creds.tenant_id, url);

    let request = ApiRequest {
        method: reqwest::Method::POST,
        url,
        query: Vec::new(),
        headers: Vec::new(),
        body: RequestBody::Form(vec![
            ("grant_type".into(), "client_credentials".into()),
            ("client_id".into(), creds.client_id.clone()),
            ("client_secret".into(), creds.client_secret.clone()),
            ("scope".into(), urls.scope()),
        ]),
    };

    let response = transport.send(&request).await?;
    let parsed: TokenResponse = serde_json::from_value(response.body)
        .map_err(|e| AzureError::login_failed(format!("invalid token response: {e}")))?;
    token_from_response(parsed)
}

/// Convert the token endpoint response, mapping AAD errors to `LoginFailed`.
fn token_from_response(resp: TokenResponse) -> AzureResult<AzureToken> {
    if let Some(error) = resp.error {
        let message = match resp.error_description {
            Some(description) => format!("{error}. {description}"),
            None => error,
        };
        return Err(AzureError::login_failed(message));
    }

    let access_token = resp
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AzureError::login_failed("token response without access_token"))?;

    let expires_at = resp
        .expires_in
        .map(|secs| Utc::now() + Duration::seconds(secs as i64));

    Ok(AzureToken {
        access_token,
        token_type: resp.token_type.unwrap_or_else(|| "Bearer".into()),
        expires_at,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::types::AzureErrorKind;
    use serde_json::json;

    fn creds() -> Credentials {
        Credentials {
            tenant_id: "tenant".into(),
            client_id: "client".into(),
            client_secret: "secret".into(),
        }
    }

    #[test]
    fn mgmt_urls_global() {
        let urls = mgmt_authority_urls(Authority::Global, "sub1");
        assert_eq!(urls.base, "https://management.azure.com/subscriptions/sub1/");
        assert_eq!(urls.scope(), "https://management.azure.com/.default");
        assert_eq!(
            urls.regional_url("westeurope", "/metrics:getBatch").unwrap(),
            "https://westeurope.metrics.monitor.azure.com/subscriptions/sub1/metrics:getBatch"
        );
    }

    #[test]
    fn mgmt_urls_china() {
        let urls = mgmt_authority_urls(Authority::China, "sub1");
        assert_eq!(urls.login_base, "https://login.partner.microsoftonline.cn");
        assert_eq!(urls.base, "https://management.chinacloudapi.cn/subscriptions/sub1/");
        assert_eq!(
            urls.regional_url("chinanorth", "/metrics:getBatch").unwrap(),
            "https://metrics.monitor.azure.cn/subscriptions/sub1/metrics:getBatch"
        );
    }

    #[test]
    fn graph_urls_have_no_regional_endpoint() {
        let urls = graph_authority_urls(Authority::Global);
        assert_eq!(urls.base, "https://graph.microsoft.com/v1.0/");
        let err = urls.regional_url("westeurope", "x").unwrap_err();
        assert_eq!(err.kind, AzureErrorKind::Config);
        assert_eq!(
            graph_authority_urls(Authority::China).resource,
            "https://microsoftgraph.chinacloudapi.cn"
        );
    }

    #[test]
    fn token_url_construction() {
        let urls = mgmt_authority_urls(Authority::Global, "");
        assert_eq!(
            urls.token_url("my-tenant-123"),
            "https://login.microsoftonline.com/my-tenant-123/oauth2/v2.0/token"
        );
    }

    #[tokio::test]
    async fn acquire_token_success() {
        let transport = MockTransport::new().with_login();
        let urls = mgmt_authority_urls(Authority::Global, "sub1");
        let token = acquire_token(&transport, &urls, &creds()).await.unwrap();
        assert_eq!(token.access_token, "test-token");
        assert!(!token.is_expired());

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        match &sent[0].body {
            RequestBody::Form(form) => {
                assert!(form.contains(&("scope".into(), "https://management.azure.com/.default".into())));
                assert!(form.contains(&("grant_type".into(), "client_credentials".into())));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_token_aad_error_carries_description() {
        let transport = MockTransport::new();
        transport.on(
            reqwest::Method::POST,
            "oauth2/v2.0/token",
            crate::client::ApiResponse::json(
                401,
                json!({"error": "invalid_client", "error_description": "AADSTS7000215: Invalid client secret"}),
            ),
        );
        let urls = mgmt_authority_urls(Authority::Global, "sub1");
        let err = acquire_token(&transport, &urls, &creds()).await.unwrap_err();
        assert_eq!(err.kind, AzureErrorKind::LoginFailed);
        assert_eq!(err.message, "invalid_client. AADSTS7000215: Invalid client secret");
    }

    #[tokio::test]
    async fn acquire_token_validation() {
        let transport = MockTransport::new();
        let urls = mgmt_authority_urls(Authority::Global, "sub1");
        let err = acquire_token(&transport, &urls, &Credentials::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AzureErrorKind::LoginFailed);
        assert!(transport.requests().is_empty());
    }
}
