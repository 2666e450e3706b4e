use std::io::Write;

use super::*;

#[test]
fn defaults_enable_bounded_queue() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.queued_rendering.enabled);
    assert_eq!(settings.queued_rendering.pool.capacity(), DEFAULT_POOL_SIZE);
    assert!(settings.queued_rendering.pool.cache_enabled());
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.queued_rendering.pool_size = Some(64);
    raw.logging.level = Some("info".to_string());

    let overrides = QueueOverrides {
        pool_size: Some(8),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_queue_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.queued_rendering.pool.capacity(), 8);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn zero_pool_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.queued_rendering.pool_size = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero capacity must fail");
    assert!(matches!(
        err,
        LoadError::Capacity(CapacityConfigError::NonPositive(0))
    ));
}

#[test]
fn negative_pool_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.queued_rendering.pool_size = Some(-3);

    let err = Settings::from_raw(raw).expect_err("negative capacity must fail");
    assert!(err.to_string().contains("queued_rendering.pool_size"));
}

#[test]
fn no_cache_and_disable_queue_flags_apply() {
    let mut raw = RawSettings::default();
    let overrides = QueueOverrides {
        no_cache: true,
        disable_queue: true,
        ..Default::default()
    };

    raw.apply_queue_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(!settings.queued_rendering.enabled);
    assert!(!settings.queued_rendering.pool.cache_enabled());
    assert!(!settings.queued_rendering.build_pool().is_bounded());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = QueueOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_queue_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn invalid_log_level_is_reported_with_key() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("unknown level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn config_file_is_layered_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    writeln!(
        file,
        "[queued_rendering]\npool_size = 16\ncache = false\n\n[logging]\nlevel = \"warn\""
    )
    .expect("write config");

    let path = file.path().to_string_lossy().into_owned();
    let args = CliArgs::parse_from([
        "render-queue",
        "--config-file",
        path.as_str(),
        "demo",
        "--pool-size",
        "4",
    ]);
    let settings = load(&args).expect("settings load");

    assert_eq!(settings.queued_rendering.pool.capacity(), 4);
    assert!(!settings.queued_rendering.pool.cache_enabled());
    assert_eq!(settings.logging.level, LevelFilter::WARN);
}

#[test]
fn parse_demo_arguments() {
    let args = CliArgs::parse_from([
        "render-queue",
        "demo",
        "--pool-size",
        "2",
        "--requests",
        "8",
        "--components",
        "30",
        "--delay-ms",
        "5",
        "--timeout-ms",
        "250",
        "--print",
    ]);

    match args.command.expect("demo command") {
        Command::Demo(demo) => {
            assert_eq!(demo.overrides.pool_size, Some(2));
            assert_eq!(demo.requests, 8);
            assert_eq!(demo.components, 30);
            assert_eq!(demo.delay_ms, 5);
            assert_eq!(demo.timeout_ms, Some(250));
            assert!(demo.print);
            assert!(!demo.overrides.no_cache);
        }
    }
}

#[test]
fn demo_defaults_without_subcommand() {
    let args = CliArgs::parse_from(["render-queue"]);
    let command = args
        .command
        .unwrap_or(Command::Demo(Box::<DemoArgs>::default()));
    let Command::Demo(demo) = command;
    assert_eq!(demo.requests, 4);
    assert!(demo.timeout_ms.is_none());
}

#[test]
fn rejects_zero_requests() {
    let result = CliArgs::try_parse_from(["render-queue", "demo", "--requests", "0"]);
    assert!(result.is_err());
}
