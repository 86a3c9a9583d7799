use std::io::Write;

use gatehouse_core::config::AppConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
flows_dir = "/tmp/gatehouse-flows"

[engine]
max_steps_per_run = 10
stream_buffer = 8
confirm_all_by_default = false
exempted_tools = ["current_time"]

[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
base_url = "http://localhost:11434/v1"
max_tokens = 2048
temperature = 0.2

[model.retry]
max_retries = 5
initial_backoff_ms = 100
max_backoff_ms = 1000

[[fallback_models]]
model_id = "gpt-4o"

[store]
path = "/tmp/gatehouse-test.db"

[gateway]
bind = "0.0.0.0:9999"

[tools]
timeout_secs = 12

[library.texts]
safety = "Refuse anything harmful."
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps_per_run, 10);
    assert_eq!(config.engine.stream_buffer, 8);
    let settings = config.engine.initial_settings();
    assert!(!settings.confirm_all);
    assert!(settings.exempted_tools.contains("current_time"));

    assert_eq!(config.model.model_id, "gpt-4o-mini");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.retry.as_ref().unwrap().max_retries, 5);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "openai");

    assert_eq!(config.store_path().to_str(), Some("/tmp/gatehouse-test.db"));
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert_eq!(config.tools.timeout_secs, 12);
    assert_eq!(
        config.library.load_texts().unwrap().get("safety").map(String::as_str),
        Some("Refuse anything harmful.")
    );
    assert_eq!(
        config.flows_dir().unwrap().to_str(),
        Some("/tmp/gatehouse-flows")
    );
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.max_steps_per_run, 25);
    assert_eq!(config.engine.stream_buffer, 64);
    assert!(config.engine.confirm_all_by_default);
    assert_eq!(config.gateway.bind, "127.0.0.1:18790");
    assert_eq!(config.tools.timeout_secs, 30);
    assert!(config.store.path.ends_with("gatehouse.db"));
    assert!(config.flows_dir.is_none());
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("GATEHOUSE_TEST_KEY_8841", "sk-from-env");
    let toml_content = r#"
[model]
model_id = "gpt-4o-mini"
api_key = "${GATEHOUSE_TEST_KEY_8841}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key.as_deref(), Some("sk-from-env"));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/gatehouse.toml")).unwrap_err();
    assert!(matches!(
        err,
        gatehouse_core::error::GatehouseError::ConfigNotFound(_)
    ));
}

#[test]
fn test_library_dir_texts_are_loaded() {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::fs::write(dir.path().join("strict.md"), "No weapons.").unwrap();
    std::fs::write(dir.path().join("ignored.json"), "{}").unwrap();

    let toml_content = format!(
        "[model]\nmodel_id = \"m\"\n\n[library]\ndir = \"{}\"\n\n[library.texts]\nstrict = \"inline wins\"\n",
        dir.path().display()
    );
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let texts = config.library.load_texts().unwrap();
    assert_eq!(texts.get("strict").map(String::as_str), Some("inline wins"));
    assert!(!texts.contains_key("ignored"));
}
