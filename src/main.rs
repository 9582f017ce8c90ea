mod broker;
mod config;
mod consumer;
mod error_sink;
mod logging;
mod payload;
mod shutdown;
mod storage;

use std::fmt;
use std::io;
use std::process;
use std::sync::Arc;

use broker::{QueueError, SledQueue};
use config::AppConfig;
use consumer::{ConsumerError, ConsumerLoop, ConsumerSettings, MessageRouter};
use error_sink::{ErrorSection, ErrorSink};
use logging::{LogLevel, Logger, LoggerSetupError};
use payload::PayloadRegistry;
use serde_json::json;
use shutdown::ShutdownHooks;
use storage::{FieldStore, StorageError, StorageFacade};

/// Failures before the consumer loop starts.
#[derive(Debug)]
enum StartupError {
    Logger(LoggerSetupError),
    Storage(StorageError),
    Queue(QueueError),
    ShutdownHooks(io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logger(source) => write!(f, "logger setup failed: {source}"),
            Self::Storage(source) => write!(f, "field store initialization failed: {source}"),
            Self::Queue(source) => write!(f, "broker queue initialization failed: {source}"),
            Self::ShutdownHooks(source) => {
                write!(f, "failed to install shutdown hooks: {source}")
            }
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Logger(source) => Some(source),
            Self::Storage(source) => Some(source),
            Self::Queue(source) => Some(source),
            Self::ShutdownHooks(source) => Some(source),
        }
    }
}

fn main() {
    let app_config = load_config_or_exit();
    let error_sink = ErrorSink::from_app_config(&app_config);

    let logger = match Logger::from_app_config(&app_config.logging) {
        Ok(logger) => Arc::new(logger),
        Err(error) => {
            error_sink.record(ErrorSection::Process, &StartupError::Logger(error));
            process::exit(2);
        }
    };
    logger.log(
        LogLevel::Info,
        Some("main::startup"),
        &format!(
            "{} v{} starting",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "application_name": app_config.broker.application_name,
            "queue_schema": app_config.queue.schema,
            "queue_name": app_config.queue.name
        })),
    );

    if let Err(failure) = run(&app_config, &logger) {
        record_failure(&error_sink, &failure);
        process::exit(1);
    }
}

enum RunError {
    Startup(StartupError),
    Consumer(ConsumerError),
}

/// Failures are reported through the error sink only.
fn record_failure(error_sink: &ErrorSink, failure: &RunError) {
    match failure {
        RunError::Startup(error) => error_sink.record(ErrorSection::Process, error),
        RunError::Consumer(error) => error_sink.record(ErrorSection::QueueLoop, error),
    }
}

fn run(app_config: &AppConfig, logger: &Arc<Logger>) -> Result<(), RunError> {
    let storage = StorageFacade::initialize(app_config, logger)
        .map_err(|error| RunError::Startup(StartupError::Storage(error)))?;
    logger.log(
        LogLevel::Debug,
        Some("main::storage"),
        "Field store ready",
        Some(json!({
            "engine": storage.engine().as_str(),
            "data_path": storage.data_path().map(|path| path.display().to_string())
        })),
    );
    let store: Arc<dyn FieldStore> = Arc::new(storage);

    let queue = SledQueue::from_app_config(app_config, logger)
        .map_err(|error| RunError::Startup(StartupError::Queue(error)))?;
    let router = MessageRouter::from_app_config(
        app_config,
        PayloadRegistry::from_app_config(app_config, Arc::clone(&store)),
    );
    let consumer = ConsumerLoop::new(
        queue.clone(),
        router,
        ConsumerSettings::from_app_config(app_config),
        Arc::clone(logger),
    );

    let shutdown_hooks = ShutdownHooks::install()
        .map_err(|error| RunError::Startup(StartupError::ShutdownHooks(error)))?;
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let outcome = consumer.run_until(|| shutdown_hooks.is_triggered());

    if let Err(error) = store.flush() {
        logger.warn(
            Some("main::shutdown"),
            &format!("field store flush failed: {error}"),
        );
    }
    if let Err(error) = queue.flush() {
        logger.warn(
            Some("main::shutdown"),
            &format!("broker queue flush failed: {error}"),
        );
    }

    let summary = outcome.map_err(RunError::Consumer)?;
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown completed",
        Some(json!({
            "processed": summary.processed,
            "idle_iterations": summary.idle
        })),
    );
    Ok(())
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Local;

    use crate::broker::QueueError;
    use crate::consumer::ConsumerError;
    use crate::error_sink::ErrorSink;
    use crate::storage::StorageError;

    use super::{RunError, StartupError, record_failure};

    #[test]
    fn failures_land_in_their_error_log_sections() {
        let dir = std::env::temp_dir().join(format!(
            "auditbridge-main-test-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let sink = ErrorSink::new(format!("{}/errors-{{date}}.log", dir.display()));

        record_failure(
            &sink,
            &RunError::Startup(StartupError::Storage(StorageError::UnsupportedEngine {
                engine: "postgres".to_owned(),
            })),
        );
        record_failure(
            &sink,
            &RunError::Consumer(ConsumerError::Queue(QueueError::SubscriptionClosed)),
        );

        let path = sink
            .path_for(Local::now().date_naive())
            .expect("log path should resolve");
        let content = std::fs::read_to_string(&path).expect("error log should exist");
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "----------");
        assert!(lines[1].ends_with("[process]"));
        assert!(lines[2].starts_with("field store initialization failed"));

        let queue_loop = lines
            .iter()
            .position(|line| line.ends_with("[queue_loop]"))
            .expect("queue loop block should be written");
        assert_eq!(lines[queue_loop - 1], "======");
        assert!(lines[queue_loop + 1].starts_with("queue facility error"));
        assert_eq!(lines.last(), Some(&"======"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
