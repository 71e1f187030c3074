use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use inspection_batcher::config::AggregatorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "INSPECTION_CONFIG",
        "INSPECTION_DEBOUNCE_MS",
        "INSPECTION_HISTORY_CAPACITY",
        "INSPECTION_NO_DETECTION_LABEL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = AggregatorConfig::load().expect("load config");
    assert_eq!(cfg.debounce_window, Duration::from_millis(1000));
    assert_eq!(cfg.history_capacity, 50);
    assert_eq!(cfg.no_detection_label, "no_detection");
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "debounce_ms": 750,
            "history": { "capacity": 20 },
            "normalizer": { "no_detection_label": "background" }
        }"#,
    );
    std::env::set_var("INSPECTION_CONFIG", file.path());
    std::env::set_var("INSPECTION_HISTORY_CAPACITY", "5");

    let cfg = AggregatorConfig::load().expect("load config");
    assert_eq!(cfg.debounce_window, Duration::from_millis(750));
    assert_eq!(cfg.history_capacity, 5);
    assert_eq!(cfg.no_detection_label, "background");

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        "debounce_ms = 2500\n\n[normalizer]\nno_detection_label = \"  empty  \"\n",
    );
    std::env::set_var("INSPECTION_CONFIG", file.path());

    let cfg = AggregatorConfig::load().expect("load config");
    assert_eq!(cfg.debounce_window, Duration::from_millis(2500));
    assert_eq!(cfg.history_capacity, 50);
    assert_eq!(cfg.no_detection_label, "empty");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INSPECTION_DEBOUNCE_MS", "soon");
    assert!(AggregatorConfig::load().is_err());

    std::env::set_var("INSPECTION_DEBOUNCE_MS", "0");
    let err = AggregatorConfig::load().unwrap_err();
    assert!(err.to_string().contains("debounce window"));

    clear_env();
    let file = write_config(".json", r#"{ "history": { "capacity": 0 } }"#);
    std::env::set_var("INSPECTION_CONFIG", file.path());
    assert!(AggregatorConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INSPECTION_CONFIG", "/nonexistent/inspection.json");
    let err = AggregatorConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}

#[test]
fn blank_no_detection_label_from_env_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INSPECTION_NO_DETECTION_LABEL", "   ");
    let err = AggregatorConfig::load().unwrap_err();
    assert!(err.to_string().contains("no-detection label"));

    clear_env();
}
