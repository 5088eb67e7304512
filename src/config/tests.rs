use std::io::Write as _;

use super::*;

#[test]
fn defaults_match_engine_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let config = CacheConfig::from(&settings.cache);
    let defaults = CacheConfig::default();

    assert_eq!(config.refresh_page_size, defaults.refresh_page_size);
    assert_eq!(config.distributed_lock_ttl_secs, defaults.distributed_lock_ttl_secs);
    assert_eq!(config.cond_retry_attempts, defaults.cond_retry_attempts);
    assert_eq!(config.max_non_all_conditions, defaults.max_non_all_conditions);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.logging.json = Some(true);
    raw.logging.level = Some("debug".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn invalid_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn zero_sizes_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.refresh_page_size = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero page size");
    assert!(matches!(err, LoadError::Invalid { key: "cache.refresh_page_size", .. }));

    let mut raw = RawSettings::default();
    raw.cache.cond_retry_attempts = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero attempts");
    assert!(matches!(err, LoadError::Invalid { key: "cache.cond_retry_attempts", .. }));

    let mut raw = RawSettings::default();
    raw.cache.distributed_lock_ttl_secs = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn inverted_resource_jitter_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.resources.insert(
        "host".to_string(),
        ResourceOverride {
            ttl_secs: None,
            jitter_min_secs: Some(60),
            jitter_max_secs: Some(10),
        },
    );

    let err = Settings::from_raw(raw).expect_err("inverted jitter");
    assert!(matches!(err, LoadError::Invalid { key: "cache.resources", .. }));
}

#[test]
fn explicit_file_is_layered_in() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        "[logging]\nlevel = \"warn\"\n\n[cache]\nrefresh_page_size = 50\n\n[cache.resources.host]\nttl_secs = 600\n"
    )
    .expect("write config");

    let settings = load(Some(file.path())).expect("valid settings");
    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.cache.refresh_page_size.get(), 50);
    assert_eq!(settings.cache.resources["host"].ttl_secs, Some(600));
}

#[test]
fn missing_explicit_file_fails() {
    let err = load(Some(Path::new("/nonexistent/rescache.toml"))).expect_err("missing file");
    assert!(matches!(err, LoadError::Build(_)));
}
