pub mod backups;
pub mod check_config;
pub mod create;
pub mod edit;
pub mod export;
pub mod list;
pub mod show;

use wt_core::model::ProjectId;

/// Parse a user-supplied project id with a readable error.
pub fn project_id(raw: &str) -> anyhow::Result<ProjectId> {
    ProjectId::new(raw).map_err(|e| anyhow::anyhow!("{e}"))
}
