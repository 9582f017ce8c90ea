//! Transactional consume loop.
//!
//! Each iteration owns exactly one receive transaction: receive with a
//! timeout, route the message, end its conversation and commit. A message is
//! acknowledged whether or not handling succeeded; a handling failure is then
//! returned as fatal so the caller can log it and stop.

mod error;
mod router;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::broker::{ConversationHandle, QueueClient, QueueMessage, ReceiveTransaction};
use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

pub use error::ConsumerError;
pub use router::{ControlMessage, MessageRouter, Outcome};

const LOG_CONTEXT: &str = "consumer::loop";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub receive_timeout: Duration,
}

impl ConsumerSettings {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            receive_timeout: Duration::from_millis(app_config.queue.receive_timeout_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing arrived within the receive timeout.
    Idle,
    Processed {
        conversation_handle: ConversationHandle,
        message_type: String,
        outcome: Outcome,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub processed: u64,
    pub idle: u64,
}

pub struct ConsumerLoop<Q: QueueClient> {
    queue: Q,
    router: MessageRouter,
    settings: ConsumerSettings,
    logger: Arc<Logger>,
}

impl<Q: QueueClient> ConsumerLoop<Q> {
    pub fn new(
        queue: Q,
        router: MessageRouter,
        settings: ConsumerSettings,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            queue,
            router,
            settings,
            logger,
        }
    }

    /// Iterates until `should_stop` returns true (checked before every
    /// iteration) or an iteration fails.
    pub fn run_until<F>(&self, mut should_stop: F) -> Result<RunSummary, ConsumerError>
    where
        F: FnMut() -> bool,
    {
        let mut summary = RunSummary::default();
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Consumer loop started",
            Some(json!({
                "receive_timeout_ms": self.settings.receive_timeout.as_millis() as u64
            })),
        );

        while !should_stop() {
            let outcome = self.run_iteration()?;
            summary.iterations += 1;
            match outcome {
                IterationOutcome::Idle => summary.idle += 1,
                IterationOutcome::Processed { .. } => summary.processed += 1,
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Consumer loop stopped",
            Some(json!({
                "iterations": summary.iterations,
                "processed": summary.processed,
                "idle": summary.idle
            })),
        );
        Ok(summary)
    }

    pub fn run_iteration(&self) -> Result<IterationOutcome, ConsumerError> {
        let mut transaction = self.queue.begin()?;

        let Some(message) = transaction.receive(self.settings.receive_timeout)? else {
            transaction.commit()?;
            self.logger
                .verbose(Some(LOG_CONTEXT), "No message within receive timeout");
            return Ok(IterationOutcome::Idle);
        };

        let started_at = Instant::now();
        let QueueMessage {
            conversation_handle,
            message_type_name,
            body,
        } = message;
        let routed = self.router.route(&message_type_name, &body);

        let acknowledged = match transaction.end_conversation(conversation_handle) {
            Ok(()) => transaction.commit(),
            Err(error) => {
                transaction.rollback();
                Err(error)
            }
        };
        if let Err(queue_error) = acknowledged {
            if let Err(processing_error) = &routed {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Message failed and could not be acknowledged; it stays queued",
                    Some(json!({
                        "conversation_handle": conversation_handle.to_string(),
                        "message_type": message_type_name,
                        "error": processing_error.to_string()
                    })),
                );
            }
            return Err(ConsumerError::Queue(queue_error));
        }

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        match routed {
            Ok(outcome) => {
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "Message processed and conversation ended",
                    Some(json!({
                        "conversation_handle": conversation_handle.to_string(),
                        "message_type": message_type_name,
                        "outcome": describe(&outcome),
                        "elapsed_ms": elapsed_ms
                    })),
                );
                Ok(IterationOutcome::Processed {
                    conversation_handle,
                    message_type: message_type_name,
                    outcome,
                })
            }
            Err(source) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Message processing failed; conversation ended before stopping",
                    Some(json!({
                        "conversation_handle": conversation_handle.to_string(),
                        "message_type": message_type_name,
                        "error_kind": source.kind(),
                        "elapsed_ms": elapsed_ms
                    })),
                );
                Err(ConsumerError::Processing {
                    conversation_handle,
                    message_type: message_type_name,
                    source,
                })
            }
        }
    }
}

fn describe(outcome: &Outcome) -> serde_json::Value {
    match outcome {
        Outcome::Acknowledged(ControlMessage::EndDialog) => json!({"control": "end_dialog"}),
        Outcome::Acknowledged(ControlMessage::Error) => json!({"control": "error"}),
        Outcome::Handled(handled) => json!({
            "kind": handled.kind,
            "writes": handled.writes
        }),
    }
}
