use chrono::Utc;
use wt_core::cache::{LoadIntent, ProjectCache};

use super::project_id;

/// Run the `export` subcommand: print one language as a JSON object of
/// key to value. Only stable strings unless `include_unstable` is set.
pub async fn run(
    cache: &ProjectCache,
    id: &str,
    language: &str,
    include_unstable: bool,
) -> anyhow::Result<()> {
    let id = project_id(id)?;
    let handle = cache.get(&id, LoadIntent::Existing).await?;
    let values = handle
        .write()
        .await
        .export_values(cache.policy(), language, !include_unstable, Utc::now());
    let Some(values) = values else {
        anyhow::bail!("project '{id}' has no language '{language}'");
    };

    tracing::debug!(project = %id, language, strings = values.len(), "language exported");
    println!("{}", serde_json::to_string_pretty(&values)?);
    Ok(())
}
