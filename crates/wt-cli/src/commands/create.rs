use wt_core::cache::{LoadIntent, ProjectCache};
use wt_core::config::ProjectsConfig;
use wt_core::model::ProjectType;

use super::project_id;

/// Run the `create` subcommand.
pub async fn run(
    cache: &ProjectCache,
    projects: &ProjectsConfig,
    id: &str,
    project_type: &str,
    base_language: &str,
    name: Option<String>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let id = project_id(id)?;
    let project_type: ProjectType = project_type.parse()?;
    if !projects.is_allowed(project_type) {
        let allowed: Vec<String> = projects.project_types.iter().map(|t| t.to_string()).collect();
        anyhow::bail!(
            "project type '{project_type}' is not enabled (allowed: {})",
            allowed.join(", ")
        );
    }
    if cache.store().exists(&id) {
        anyhow::bail!("project '{id}' already exists");
    }

    let handle = cache
        .get(
            &id,
            LoadIntent::CreateIfMissing {
                project_type,
                base_language: base_language.to_string(),
            },
        )
        .await?;
    {
        let mut project = handle.write().await;
        if let Some(name) = name {
            project.name = name;
        }
        project.url = url;
        project.mark_dirty();
    }
    drop(handle);
    cache.flush(&id).await?;

    tracing::info!(project = %id, project_type = %project_type, "project created");
    println!("created {id} ({project_type}, base language {base_language})");
    Ok(())
}
