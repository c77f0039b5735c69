use wt_core::store::ProjectStore;

use super::project_id;

/// Run the `backups` subcommand.
pub fn run(store: &ProjectStore, id: &str) -> anyhow::Result<()> {
    let id = project_id(id)?;
    let sets = store.backups(&id)?;
    if sets.is_empty() {
        anyhow::bail!("project '{id}' has no files in {}", store.root().display());
    }

    for set in sets {
        println!("{}", set.path.display());
        if set.backups.is_empty() {
            println!("  (no backups)");
        }
        for (i, backup) in set.backups.iter().enumerate() {
            let size = std::fs::metadata(backup).map(|m| m.len()).unwrap_or(0);
            println!("  {:>2}. {} ({size} bytes)", i + 1, backup.display());
        }
    }
    Ok(())
}
