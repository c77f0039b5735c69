use std::path::Path;

use wt_core::config::Config;

/// Run the `check-config` subcommand. Loading already validated the config;
/// this prints where it came from and the effective values.
pub fn run(config: &Config, path: Option<&Path>) -> anyhow::Result<()> {
    let source = match path {
        Some(path) => path.display().to_string(),
        None if Config::default_path().exists() => Config::default_path().display().to_string(),
        None => "built-in defaults".to_string(),
    };
    println!("# config OK ({source})");
    println!("# project root: {}", config.storage.project_root_path().display());
    print!("{}", config.to_toml()?);
    Ok(())
}
