use std::borrow::Cow;

use roxmltree::Document;

use crate::config::AppConfig;
use crate::payload::{HandlerOutcome, PayloadRegistry, ProcessingError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    EndDialog,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Conversation lifecycle message; nothing to handle beyond ending it.
    Acknowledged(ControlMessage),
    Handled(HandlerOutcome),
}

pub struct MessageRouter {
    end_dialog_message_type: String,
    error_message_type: String,
    payloads: PayloadRegistry,
}

impl MessageRouter {
    pub fn new(
        end_dialog_message_type: impl Into<String>,
        error_message_type: impl Into<String>,
        payloads: PayloadRegistry,
    ) -> Self {
        Self {
            end_dialog_message_type: end_dialog_message_type.into(),
            error_message_type: error_message_type.into(),
            payloads,
        }
    }

    pub fn from_app_config(app_config: &AppConfig, payloads: PayloadRegistry) -> Self {
        Self::new(
            app_config.queue.end_dialog_message_type.clone(),
            app_config.queue.error_message_type.clone(),
            payloads,
        )
    }

    pub fn classify_control(&self, message_type: &str) -> Option<ControlMessage> {
        if message_type == self.end_dialog_message_type {
            Some(ControlMessage::EndDialog)
        } else if message_type == self.error_message_type {
            Some(ControlMessage::Error)
        } else {
            None
        }
    }

    pub fn route(&self, message_type: &str, body: &[u8]) -> Result<Outcome, ProcessingError> {
        if let Some(control) = self.classify_control(message_type) {
            return Ok(Outcome::Acknowledged(control));
        }

        let classification = |reason: String| ProcessingError::Classification {
            message_type: message_type.to_owned(),
            reason,
        };

        if message_type.is_empty() {
            return Err(classification("message type is empty".to_owned()));
        }
        let handler = self
            .payloads
            .resolve(message_type)
            .ok_or_else(|| classification("no payload handler is registered".to_owned()))?;

        let text = decode_body(body).map_err(classification)?;
        let document = Document::parse(&text)
            .map_err(|error| classification(format!("body is not well-formed XML: {error}")))?;

        handler.handle(&document).map(Outcome::Handled)
    }
}

const UTF8_BOM: &[u8] = &[0xef, 0xbb, 0xbf];
const UTF16LE_BOM: &[u8] = &[0xff, 0xfe];
const UTF16BE_BOM: &[u8] = &[0xfe, 0xff];

/// Decodes a message body using its byte-order mark. Bodies without one must
/// be UTF-8. XML cast to `varbinary` by the database arrives as UTF-16LE.
fn decode_body(body: &[u8]) -> Result<Cow<'_, str>, String> {
    if let Some(rest) = body.strip_prefix(UTF8_BOM) {
        return std::str::from_utf8(rest)
            .map(Cow::Borrowed)
            .map_err(|error| format!("body is not UTF-8: {error}"));
    }
    if let Some(rest) = body.strip_prefix(UTF16LE_BOM) {
        return decode_utf16(rest, u16::from_le_bytes).map(Cow::Owned);
    }
    if let Some(rest) = body.strip_prefix(UTF16BE_BOM) {
        return decode_utf16(rest, u16::from_be_bytes).map(Cow::Owned);
    }
    std::str::from_utf8(body)
        .map(Cow::Borrowed)
        .map_err(|error| format!("body is not UTF-8: {error}"))
}

fn decode_utf16(raw: &[u8], unit: fn([u8; 2]) -> u16) -> Result<String, String> {
    if raw.len() % 2 != 0 {
        return Err(format!("UTF-16 body has odd length {}", raw.len() + 2));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|error| format!("body is not UTF-16: {error}"))
}
