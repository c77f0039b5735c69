use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use wt_core::cache::{LoadIntent, ProjectCache};
use wt_core::model::{Project, StabilityState};

use super::project_id;

#[derive(Debug, Serialize)]
struct StringRow {
    key: String,
    text: String,
    stability: StabilityState,
    changes: u64,
    last_author: Option<String>,
}

/// Run the `show` subcommand.
pub async fn run(
    cache: &ProjectCache,
    id: &str,
    language: Option<&str>,
    json_output: bool,
) -> anyhow::Result<()> {
    let id = project_id(id)?;
    let handle = cache.get(&id, LoadIntent::Existing).await?;
    let mut project = handle.write().await;
    let now = Utc::now();

    let Some(code) = language else {
        let reports = project.refresh_stability(cache.policy(), now);
        if json_output {
            let doc = json!({
                "id": project.id(),
                "type": project.project_type(),
                "name": project.name,
                "url": project.url,
                "base_language": project.base_language_code(),
                "languages": reports,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        } else {
            println!("{} ({}) {}", project.id(), project.project_type(), project.name);
            if let Some(url) = &project.url {
                println!("{url}");
            }
            println!("{:<12} {:>7} {:>7} {:>9}", "LANGUAGE", "STRINGS", "STABLE", "UNSTABLE");
            for report in reports {
                println!(
                    "{:<12} {:>7} {:>7} {:>9}",
                    report.code, report.total, report.stable, report.unstable
                );
            }
        }
        return Ok(());
    };

    let rows = string_rows(&mut project, cache, code)?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in rows {
            println!(
                "{:<32} {:<8} {:>3}  {}",
                row.key,
                row.stability.to_string(),
                row.changes,
                row.text
            );
        }
    }
    Ok(())
}

fn string_rows(
    project: &mut Project,
    cache: &ProjectCache,
    code: &str,
) -> anyhow::Result<Vec<StringRow>> {
    let keys: Vec<String> = match project.language(code) {
        Some(table) => table.iter().map(|(key, _)| key.to_string()).collect(),
        None => anyhow::bail!("project '{}' has no language '{code}'", project.id()),
    };

    let now = Utc::now();
    let mut rows = Vec::with_capacity(keys.len());
    for key in keys {
        let stability = project
            .classify(cache.policy(), code, &key, now)
            .unwrap_or_default();
        let Some(entry) = project.language(code).and_then(|t| t.get(&key)) else {
            continue;
        };
        rows.push(StringRow {
            text: entry.value().text.clone(),
            stability,
            changes: entry.lifetime_changes(),
            last_author: entry.newest_change().map(|c| c.author().to_string()),
            key,
        });
    }
    Ok(rows)
}
