use std::collections::HashMap;
use std::path::PathBuf;

use macwatch_config::{
    ConfigLoadError, ConfigLoader, ConfigLoaderOptions, ConfigWarning,
};
use tempfile::TempDir;

fn loader_for(path: PathBuf) -> ConfigLoader {
    ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: Some(path),
        env_file: None,
    })
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

const TOML_FIXTURE: &str = r#"
[watch]
root = "/srv/kismet"
rescan_interval_ms = 120000

[stability]
required_stable_samples = 3
sample_interval_ms = 2000

[queue]
max_size = 45

[lookup]
failure_threshold = 5
cooldown_ms = 60000
"#;

#[test]
fn toml_file_with_guard_rails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("macwatch.toml");
    std::fs::write(&path, TOML_FIXTURE).unwrap();

    let load = loader_for(path.clone()).load_with_env(env(&[])).unwrap();
    assert_eq!(load.source, Some(path));

    let config = load.config;
    assert_eq!(config.watch.root, PathBuf::from("/srv/kismet"));
    assert_eq!(config.watch.rescan_interval_ms, 120_000);
    assert_eq!(config.watch.extension, "kismet");
    assert_eq!(config.stability.required_stable_samples, 3);
    assert_eq!(config.stability.max_wait_ms, 300_000);
    assert_eq!(config.queue.max_size, 30);
    assert_eq!(config.lookup.failure_threshold, 5);

    assert!(load.warnings.contains(&ConfigWarning::QueueSizeClamped {
        requested: 45,
        effective: 30,
    }));
}

#[test]
fn environment_wins_over_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("macwatch.toml");
    std::fs::write(&path, TOML_FIXTURE).unwrap();

    let load = loader_for(path)
        .load_with_env(env(&[
            ("WATCH_DIRECTORY", "/mnt/usb"),
            ("FILE_QUEUE_MAX_SIZE", "8"),
        ]))
        .unwrap();

    assert_eq!(load.config.watch.root, PathBuf::from("/mnt/usb"));
    assert_eq!(load.config.queue.max_size, 8);
    assert!(load.warnings.is_empty());
}

#[test]
fn json_file_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("macwatch.json");
    std::fs::write(
        &path,
        r#"{"lookup": {"api_key": "k", "batch_size": 8}, "output": {"processed_dir": "/done"}}"#,
    )
    .unwrap();

    let config = loader_for(path).load_with_env(env(&[])).unwrap().config;
    assert_eq!(config.lookup.api_key.as_deref(), Some("k"));
    assert_eq!(config.lookup.batch_size, 8);
    assert_eq!(config.output.processed_dir, Some(PathBuf::from("/done")));
}

#[test]
fn config_path_from_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, "[queue]\nmax_size = 3\n").unwrap();
    let raw = path.to_string_lossy().into_owned();

    let load = ConfigLoader::new()
        .load_with_env(env(&[("MACWATCH_CONFIG_PATH", raw.as_str())]))
        .unwrap();
    assert_eq!(load.config.queue.max_size, 3);
    assert_eq!(load.source, Some(path));
}

#[test]
fn bad_files_are_errors() {
    let dir = TempDir::new().unwrap();

    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[queue\nmax_size = ").unwrap();
    assert!(matches!(
        loader_for(broken).load_with_env(env(&[])),
        Err(ConfigLoadError::Toml { .. })
    ));

    let yaml = dir.path().join("macwatch.yaml");
    std::fs::write(&yaml, "queue: {}").unwrap();
    assert!(matches!(
        loader_for(yaml).load_with_env(env(&[])),
        Err(ConfigLoadError::UnsupportedFormat { .. })
    ));

    assert!(matches!(
        loader_for(dir.path().join("missing.toml")).load_with_env(env(&[])),
        Err(ConfigLoadError::Io { .. })
    ));
}

#[test]
fn overrides_are_validated_like_file_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("macwatch.toml");
    std::fs::write(&path, "[lookup]\nmax_interval_ms = 10000\n").unwrap();

    let load = loader_for(path)
        .load_layers(env(&[("FILE_QUEUE_MAX_SIZE", "8")]), |config| {
            config.queue.max_size = 0;
            config.lookup.min_interval_ms = 30_000;
        })
        .unwrap();

    assert_eq!(load.config.queue.max_size, 1);
    assert_eq!(load.config.lookup.max_interval_ms, 30_000);
    assert!(load.warnings.contains(&ConfigWarning::QueueSizeClamped {
        requested: 0,
        effective: 1,
    }));
    assert!(load.warnings.contains(&ConfigWarning::IntervalBoundsInverted {
        min_ms: 30_000,
        max_ms: 10_000,
    }));
}
