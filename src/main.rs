mod agent;
mod clock;
mod config;
mod discovery;
mod dispatch;
mod logging;
mod registry;
mod server;
mod shutdown;
mod wire;

use std::process;
use std::sync::Arc;

use agent::{Agent, AgentOutcome, AgentSettings, AgentState};
use clock::SystemClock;
use config::{AppConfig, LoadedConfig};
use dispatch::{AgentDispatcher, FsArtifactStore};
use logging::{LogLevel, Logger, LoggerConfig};
use serde_json::json;
use shutdown::ShutdownHooks;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let loaded = load_config_or_exit();
    let app_config = &loaded.config;
    let logger_config =
        LoggerConfig::from_logging_config(&app_config.logging).unwrap_or_else(|error| {
            eprintln!("{error}");
            process::exit(2);
        });
    let logger = Arc::new(Logger::new(logger_config));

    logger.log(
        LogLevel::Info,
        Some("main::config"),
        &format!("Configuration loaded from {}", loaded.source),
        Some(json!({
            "broadcast_port": app_config.discovery.broadcast_port,
            "timeout_ms": app_config.discovery.timeout_ms,
            "control_port": app_config.server.port,
            "max_connections": app_config.server.max_connections,
            "paths": {
                "as_built": app_config.paths.as_built_location,
                "config": app_config.paths.config_location,
                "ofs": app_config.paths.ofs_location,
                "sdcard": app_config.paths.sdcard_location,
            },
        })),
    );
    for adjustment in &loaded.adjustments {
        logger.warn(Some("main::config"), adjustment);
    }

    let state = Arc::new(AgentState::new());
    let shutdown_hooks =
        ShutdownHooks::install_into(state.shutdown_flag()).unwrap_or_else(|error| {
            eprintln!("failed to install shutdown hooks: {error}");
            process::exit(2);
        });

    let store = FsArtifactStore::from_paths_config(&app_config.paths);
    let dispatcher = AgentDispatcher::new(Arc::clone(&state), Arc::new(store), Arc::clone(&logger));
    let agent = Agent::new(
        AgentSettings::from_config(app_config),
        state,
        Arc::new(SystemClock::new()),
        Arc::new(dispatcher),
        Arc::clone(&logger),
    );

    match agent.run() {
        Ok(AgentOutcome::Served { wake_peer }) => {
            logger.info(
                Some("main::shutdown"),
                &format!("Control session cycle for {wake_peer} completed"),
            );
        }
        Ok(AgentOutcome::Standalone) => {
            logger.info(Some("main::shutdown"), "Standalone mode, nothing to serve");
        }
        Ok(AgentOutcome::Interrupted) => {
            logger.info(Some("main::shutdown"), "Discovery interrupted by shutdown signal");
        }
        Err(error) => {
            logger.error(Some("main::shutdown"), &error.to_string());
            process::exit(2);
        }
    }

    if shutdown_hooks.is_triggered() {
        logger.info(Some("main::shutdown"), "Shutdown requested");
    }
}

fn load_config_or_exit() -> LoadedConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: unit-updater is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
  _   _       _ _     _   _           _       _
 | | | |_ __ (_) |_  | | | |_ __   __| | __ _| |_ ___ _ __
 | | | | '_ \| | __| | | | | '_ \ / _` |/ _` | __/ _ \ '__|
 | |_| | | | | | |_  | |_| | |_) | (_| | (_| | ||  __/ |
  \___/|_| |_|_|\__|  \___/| .__/ \__,_|\__,_|\__\___|_|
                           |_|                              "#;
    const APP_DESCRIPTION: &str =
        "Field unit maintenance agent: UDP wake-up discovery and TCP control sessions.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("UNIT_UPDATER_BUILD_DATE_UTC"),
        env!("UNIT_UPDATER_BUILD_PROFILE")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Licensed under MIT, provided \"AS IS\" without warranty.{RESET}");
    println!();
    println!("================================================================");
    println!();
}
