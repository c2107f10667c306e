//! Directory level services queried through Microsoft Graph.

use std::future::Future;

use cmk_azure::graph::{applications, organizations, users_count};
use cmk_azure::{AzureClient, AzureErrorKind};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::{AgentError, AgentResult};
use crate::section::{python_json_sorted, Section};

pub const USERS_COUNT_SERVICE: &str = "users_count";
pub const AD_CONNECT_SERVICE: &str = "ad_connect";
pub const APP_REGISTRATIONS_SERVICE: &str = "app_registrations";

const GRAPH_COMPONENT: &str = "Graph client (async)";

/// Whether any configured service needs the Graph client.
pub fn graph_services_enabled(ctx: &RunContext) -> bool {
    [USERS_COUNT_SERVICE, AD_CONNECT_SERVICE, APP_REGISTRATIONS_SERVICE]
        .iter()
        .any(|service| ctx.args.has_service(service))
}

/// One sorted JSON line per application that has client secrets.
pub fn app_registration_lines(apps: &[cmk_azure::types::GraphApplication]) -> Vec<String> {
    apps.iter()
        .filter(|app| !app.password_credentials.is_empty())
        .filter_map(|app| serde_json::to_value(app).ok())
        .map(|app| python_json_sorted(&app))
        .collect()
}

async fn users_count_section(client: &AzureClient) -> AgentResult<Section> {
    let count = users_count(client).await?;
    let mut section = Section::main("ad");
    section.add(["users_count".to_string(), count.to_string()]);
    Ok(section)
}

async fn ad_connect_section(client: &AzureClient) -> AgentResult<Section> {
    let orgs = organizations(client).await?;
    let mut section = Section::main("ad");
    section.add(["ad_connect".to_string(), python_json_sorted(&Value::Array(orgs))]);
    Ok(section)
}

async fn app_registration_section(client: &AzureClient) -> AgentResult<Section> {
    let apps = applications(client).await?;
    let mut section = Section::main_sep("app_registration", 0);
    for line in app_registration_lines(&apps) {
        section.add([line]);
    }
    Ok(section)
}

/// Run `section` only when its service is enabled.
async fn when_enabled<F>(enabled: bool, section: F) -> Option<AgentResult<Section>>
where
    F: Future<Output = AgentResult<Section>>,
{
    if !enabled {
        return None;
    }
    Some(section.await)
}

fn always_bailout(error: &AgentError) -> bool {
    error.is_kind(AzureErrorKind::LoginFailed) || error.is_kind(AzureErrorKind::AuthorizationRequestDenied)
}

fn handle_graph_error(ctx: &RunContext, error: AgentError) -> AgentResult<()> {
    if always_bailout(&error) {
        return ctx.bailout(&error, GRAPH_COMPONENT, None);
    }
    ctx.handle_error(error, GRAPH_COMPONENT, None)
}

/// Log in to Graph and write the enabled directory services. Each service
/// writes its own section; a failing one is reported without stopping the
/// others. Login and permission problems are reported, never raised.
pub async fn process_graph(ctx: &RunContext) -> AgentResult<()> {
    if !graph_services_enabled(ctx) {
        return Ok(());
    }
    let mut client = ctx.graph_client();
    if let Err(e) = client.login(&ctx.args.credentials()).await {
        return handle_graph_error(ctx, e.into());
    }

    let client = &client;
    let (users, ad_connect, app_registrations) = futures::join!(
        when_enabled(ctx.args.has_service(USERS_COUNT_SERVICE), users_count_section(client)),
        when_enabled(ctx.args.has_service(AD_CONNECT_SERVICE), ad_connect_section(client)),
        when_enabled(
            ctx.args.has_service(APP_REGISTRATIONS_SERVICE),
            app_registration_section(client)
        ),
    );

    for result in [users, ad_connect, app_registrations].into_iter().flatten() {
        match result {
            Ok(section) => ctx.write(&section)?,
            Err(e) => handle_graph_error(ctx, e)?,
        }
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cmk_azure::types::GraphApplication;
    use serde_json::json;

    #[test]
    fn only_apps_with_secrets_are_reported() {
        let apps: Vec<GraphApplication> = serde_json::from_value(json!([
            {"id": "1", "appId": "a1", "displayName": "with secret", "signInAudience": "x",
             "passwordCredentials": [{"displayName": "s", "endDateTime": "2025-01-01T00:00:00Z"}]},
            {"id": "2", "appId": "a2", "displayName": "no secret", "passwordCredentials": []},
        ]))
        .unwrap();
        assert_eq!(
            app_registration_lines(&apps),
            vec![
                r#"{"appId": "a1", "displayName": "with secret", "id": "1", "passwordCredentials": [{"displayName": "s", "endDateTime": "2025-01-01T00:00:00Z"}]}"#
            ]
        );
    }
}
