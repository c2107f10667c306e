//! Recovery Services vault queries.

use log::debug;

use crate::client::{ApiCall, AzureClient};
use crate::types::{AzureResult, ProtectedItem};

pub const RECOVERY_API_VERSION: &str = "2025-02-01";

/// Items protected by the backup of vault `name`.
pub async fn backup_protected_items(
    client: &AzureClient,
    group: &str,
    name: &str,
) -> AzureResult<Vec<ProtectedItem>> {
    let uri = format!(
        "resourceGroups/{group}/providers/Microsoft.RecoveryServices/vaults/{name}/backupProtectedItems"
    );
    debug!("backup_protected_items({}, {}) → {}", group, name, uri);
    client
        .request_as(ApiCall::get(uri).api_version(RECOVERY_API_VERSION).key("value"))
        .await
}

// ─── Tests ──────────────────────────────────────────────────────────
