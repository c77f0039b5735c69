use std::collections::HashMap;

use wt_core::codec::Codec;
use wt_core::config::{Config, ConfigError, LogFormat};
use wt_core::layout::Layout;
use wt_core::model::ProjectType;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, LogFormat::Pretty);
    assert_eq!(cfg.storage.project_root, "./projects");
    assert_eq!(cfg.storage.storage_format, Layout::OneFile);
    assert_eq!(cfg.storage.data_format, Codec::Xml);
    assert_eq!(cfg.storage.language_file_size, 100_000);
    assert_eq!(cfg.storage.num_backup_files, 5);
    assert_eq!(cfg.cache.project_cache, 1);
    assert_eq!(cfg.history.max_num_changes, 5);
    assert_eq!(cfg.history.min_num_changes, 2);
    assert_eq!(cfg.history.change_stable_age, 600);
    assert!(cfg.projects.is_allowed(ProjectType::NewGrf));
    assert!(cfg.projects.is_allowed(ProjectType::GameScript));
    assert!(!cfg.projects.is_allowed(ProjectType::OpenTtd));
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.storage.storage_format = Layout::SplitLanguages;
    cfg.storage.data_format = Codec::Json;
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("split-languages"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.storage.storage_format, Layout::SplitLanguages);
    assert_eq!(parsed.storage.data_format, Codec::Json);
    assert_eq!(parsed.projects.project_types, cfg.projects.project_types);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[storage]
storage_format = "split-languages"
num_backup_files = 2

[projects]
project_types = ["openttd"]
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.storage.storage_format, Layout::SplitLanguages);
    assert_eq!(cfg.storage.num_backup_files, 2);
    assert_eq!(cfg.projects.project_types, vec![ProjectType::OpenTtd]);
    // defaults should fill in the rest
    assert_eq!(cfg.storage.data_format, Codec::Xml);
    assert_eq!(cfg.cache.project_cache, 1);
    assert_eq!(cfg.history.max_num_changes, 5);
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file_applies_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[cache]\nproject_cache = 4\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.cache.project_cache, 4);

    std::fs::write(&path, "[cache]\nproject_cache = 0\n").unwrap();
    assert!(matches!(
        Config::load_from(&path),
        Err(ConfigError::Validation(_))
    ));

    std::fs::write(&path, "[cache\n").unwrap();
    assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));

    assert!(matches!(
        Config::load_from(dir.path().join("absent.toml")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn env_overrides_win_over_file_values() {
    let mut cfg = Config::default();
    cfg.apply_env_overrides(env(&[
        ("WT_PROJECT_ROOT", "/srv/projects"),
        ("WT_STORAGE_FORMAT", "split-languages"),
        ("WT_DATA_FORMAT", "JSON"),
        ("WT_PROJECT_CACHE", " 8 "),
        ("WT_MIN_NUM_CHANGES", "-1"),
        ("WT_CHANGE_STABLE_AGE", "0"),
    ]))
    .expect("overrides parse");

    assert_eq!(cfg.storage.project_root, "/srv/projects");
    assert_eq!(cfg.storage.storage_format, Layout::SplitLanguages);
    assert_eq!(cfg.storage.data_format, Codec::Json);
    assert_eq!(cfg.cache.project_cache, 8);
    assert_eq!(cfg.history.min_num_changes, -1);
    assert_eq!(cfg.history.change_stable_age, 0);
    cfg.validate().expect("config validates");
}

#[test]
fn unparsable_env_override_is_parse_error() {
    let mut cfg = Config::default();
    let err = cfg
        .apply_env_overrides(env(&[("WT_NUM_BACKUP_FILES", "many")]))
        .expect_err("should fail");
    assert!(matches!(err, ConfigError::Parse(_)));
    assert!(err.to_string().contains("WT_NUM_BACKUP_FILES"));
}

#[test]
fn invalid_values_fail_validation() {
    let mut cfg = Config::default();
    cfg.history.max_num_changes = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_num_changes"));

    let mut cfg = Config::default();
    cfg.history.change_stable_age = -5;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.projects.project_types = vec![ProjectType::NewGrf, ProjectType::NewGrf];
    let err = cfg.validate().expect_err("duplicate types");
    assert!(err.to_string().contains("duplicate"));

    let mut cfg = Config::default();
    cfg.projects.project_types.clear();
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.storage.language_file_size = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn unknown_enum_values_are_rejected_by_the_parser() {
    let bad = "[storage]\ndata_format = \"yaml\"\n";
    assert!(toml::from_str::<Config>(bad).is_err());
}
