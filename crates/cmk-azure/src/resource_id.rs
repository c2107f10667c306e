//! Helpers for ARM resource id paths
//! (`/subscriptions/{sub}/resourceGroups/{group}/providers/{ns}/{type}/{name}`).

use crate::types::{AzureError, AzureResult};

/// Subscription, resource group and provider named by a resource id, in
/// the order they first appear. A repeated segment keeps its first position
/// and takes the later value.
///
/// Keys are `subscription`, `provider` and `group`. The `resourceGroups`
/// segment is matched case-insensitively; ARM uses both spellings.
pub fn attrs_from_uri(uri: &str) -> Vec<(&'static str, String)> {
    let segments: Vec<&str> = uri.split('/').collect();
    let mut attrs: Vec<(&'static str, String)> = Vec::new();
    for (idx, segment) in segments.iter().enumerate() {
        let Some(next) = segments.get(idx + 1) else {
            continue;
        };
        let key = match *segment {
            "subscriptions" => "subscription",
            "providers" => "provider",
            s if s.eq_ignore_ascii_case("resourcegroups") => "group",
            _ => continue,
        };
        match attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = next.to_string(),
            None => attrs.push((key, next.to_string())),
        }
    }
    attrs
}

/// Value of one attribute of [`attrs_from_uri`].
pub fn attr_from_uri(uri: &str, key: &str) -> Option<String> {
    attrs_from_uri(uri)
        .into_iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Values following `subscriptions`, `resourcegroups` and each of
/// `resource_types` in a lower-cased id, in that order.
pub fn params_from_azure_id(resource_id: &str, resource_types: &[&str]) -> AzureResult<Vec<String>> {
    let lowered = resource_id.to_lowercase();
    let values: Vec<&str> = lowered.split('/').collect();

    let keywords = ["subscriptions", "resourcegroups"]
        .into_iter()
        .map(str::to_string)
        .chain(resource_types.iter().map(|t| t.to_lowercase()));

    keywords
        .map(|keyword| {
            values
                .iter()
                .position(|v| *v == keyword)
                .and_then(|idx| values.get(idx + 1))
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    AzureError::api(format!("{keyword} not found in resource id {resource_id}"))
                })
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────
