use wt_core::store::ProjectStore;

/// Run the `list` subcommand: one line per stored project.
pub fn run(store: &ProjectStore) -> anyhow::Result<()> {
    let ids = store.list()?;
    if ids.is_empty() {
        println!("no projects in {}", store.root().display());
        return Ok(());
    }

    println!("{:<24} {:<12} {:>9}  NAME", "ID", "TYPE", "LANGUAGES");
    for id in ids {
        match store.read(&id) {
            Ok(project) => println!(
                "{:<24} {:<12} {:>9}  {}",
                id,
                project.project_type(),
                project.languages().count() + 1,
                project.name
            ),
            Err(e) => println!("{:<24} unreadable: {e}", id),
        }
    }
    Ok(())
}
