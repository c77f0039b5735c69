use chrono::Utc;
use wt_core::cache::ProjectCache;
use wt_core::model::StringValue;

use super::project_id;

/// Parse `NAME=TEXT` into a case variant.
pub fn parse_case(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, text)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), text.to_string()))
        }
        _ => Err(format!("expected NAME=TEXT, got '{raw}'")),
    }
}

/// Run the `edit` subcommand: record the change and write it out.
pub async fn run(
    cache: &ProjectCache,
    id: &str,
    language: &str,
    key: &str,
    text: String,
    author: &str,
    cases: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let id = project_id(id)?;
    let value = cases
        .into_iter()
        .fold(StringValue::new(text), |value, (case, text)| {
            value.with_case(case, text)
        });

    let state = cache
        .record_change(&id, language, key, value, author, Utc::now())
        .await?;
    cache.flush(&id).await?;

    println!("{id} {language} {key}: recorded, now {state}");
    Ok(())
}
