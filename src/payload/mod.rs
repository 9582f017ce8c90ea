//! Application payload handlers.
//!
//! A handler receives an already parsed XML document and applies its side
//! effects. Handlers are looked up by message type in a [`PayloadRegistry`],
//! so new payload kinds only need a registration.

mod change_set;
mod error;

use std::collections::HashMap;
use std::sync::Arc;

use roxmltree::Document;

use crate::config::AppConfig;
use crate::storage::FieldStore;

use change_set::ChangeSetHandler;
pub use error::ProcessingError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub kind: &'static str,
    /// Reserved for a reply message; not sent anywhere yet.
    pub response: String,
    pub writes: usize,
}

pub trait PayloadHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    fn handle(&self, document: &Document<'_>) -> Result<HandlerOutcome, ProcessingError>;
}

#[derive(Default)]
pub struct PayloadRegistry {
    by_message_type: HashMap<String, Arc<dyn PayloadHandler>>,
    fallback: Option<Arc<dyn PayloadHandler>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change-set handling for the configured application message types, or
    /// for every application message type when none are configured.
    pub fn from_app_config(app_config: &AppConfig, store: Arc<dyn FieldStore>) -> Self {
        let handler: Arc<dyn PayloadHandler> = Arc::new(ChangeSetHandler::new(store));
        let mut registry = Self::new();

        if app_config.queue.application_message_types.is_empty() {
            registry.set_fallback(handler);
        } else {
            for message_type in &app_config.queue.application_message_types {
                registry.register(message_type.clone(), Arc::clone(&handler));
            }
        }
        registry
    }

    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn PayloadHandler>,
    ) -> Option<Arc<dyn PayloadHandler>> {
        self.by_message_type.insert(message_type.into(), handler)
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn PayloadHandler>) {
        self.fallback = Some(handler);
    }

    pub fn resolve(&self, message_type: &str) -> Option<&dyn PayloadHandler> {
        self.by_message_type
            .get(message_type)
            .or(self.fallback.as_ref())
            .map(|handler| handler.as_ref())
    }
}
