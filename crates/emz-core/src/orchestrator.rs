//! Processing orchestrator.
//!
//! Bridges a "process files" request to the upload client and turns every
//! outcome into exactly one [`UploadResult`]. The result is delivered to two
//! sinks: a [`Notifier`] and the persisted `processingState` record.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::CoreError;
use crate::storage::ExtensionStorage;
use crate::teams::{
    EmojiUploader, FileInput, ProcessUpdate, ProcessingState, TokenSet, TokenStore,
    UploadResult, UploadSettings,
};

/// Message returned when any token is missing.
pub const MISSING_TOKENS_MESSAGE: &str = "Could not find required tokens";

/// Requests accepted from the interactive surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum InboundMessage {
    /// Upload a batch of files.
    #[serde(rename = "processFiles")]
    ProcessFiles {
        /// JSON-encoded list of [`FileInput`].
        files: String,
        /// Tokens collected by the caller.
        #[serde(default)]
        tokens: TokenSet,
    },
}

/// Receives a [`ProcessUpdate`] after every processing attempt.
pub trait Notifier {
    /// Deliver an update. Must not fail.
    fn notify(&self, update: &ProcessUpdate);
}

/// Notifier that only writes updates to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, update: &ProcessUpdate) {
        if update.success {
            log::info!("process update: {}", update.status.as_deref().unwrap_or(""));
        } else {
            log::warn!("process update: {}", update.error.as_deref().unwrap_or(""));
        }
    }
}

impl Notifier for broadcast::Sender<ProcessUpdate> {
    fn notify(&self, update: &ProcessUpdate) {
        if self.send(update.clone()).is_err() {
            log::debug!("no subscribers for process update");
        }
    }
}

/// Something that went wrong, in any of the shapes callers produce.
pub enum ErrorValue {
    /// A typed error; its message is shown.
    Error(Box<dyn std::error::Error + Send + Sync>),
    /// A string, possibly holding JSON.
    Text(String),
    /// A structured value.
    Structured(Value),
    /// Anything else that can be displayed.
    Opaque(Box<dyn fmt::Display + Send + Sync>),
}

impl fmt::Debug for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Structured(v) => f.debug_tuple("Structured").field(v).finish(),
            Self::Opaque(d) => f.debug_tuple("Opaque").field(&d.to_string()).finish(),
        }
    }
}

impl From<CoreError> for ErrorValue {
    fn from(e: CoreError) -> Self {
        Self::Error(Box::new(e))
    }
}

impl From<String> for ErrorValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ErrorValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Value> for ErrorValue {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => Self::Text(s),
            other => Self::Structured(other),
        }
    }
}

/// Render an error for display.
///
/// Typed errors show their message, JSON text and structured values are
/// pretty-printed with two-space indentation, and everything else is shown
/// through `Display`. Never fails.
#[must_use]
pub fn format_error_message(error: &ErrorValue) -> String {
    match error {
        ErrorValue::Error(e) => e.to_string(),
        ErrorValue::Text(text) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|parsed| serde_json::to_string_pretty(&parsed).ok())
            .unwrap_or_else(|| text.clone()),
        ErrorValue::Structured(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        ErrorValue::Opaque(display) => display.to_string(),
    }
}

/// Runs processing requests and publishes their results.
#[derive(Debug)]
pub struct Orchestrator<S, N> {
    storage: S,
    notifier: N,
    settings: UploadSettings,
}

impl<S, N> Orchestrator<S, N>
where
    S: ExtensionStorage,
    N: Notifier,
{
    /// Create an orchestrator writing status to `storage` and updates to `notifier`.
    #[must_use]
    pub const fn new(storage: S, notifier: N, settings: UploadSettings) -> Self {
        Self {
            storage,
            notifier,
            settings,
        }
    }

    /// The storage results are persisted to.
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Collect tokens previously captured into the storage.
    #[must_use]
    pub fn collect_tokens(&self) -> TokenSet {
        TokenStore::collect_from_extension_storage(&self.storage)
    }

    /// Handle an inbound message from the interactive surface.
    pub async fn handle_message(&self, message: InboundMessage) -> UploadResult {
        match message {
            InboundMessage::ProcessFiles { files, tokens } => {
                match serde_json::from_str::<Vec<FileInput>>(&files) {
                    Ok(files) => self.handle_processing(&files, &tokens).await,
                    Err(e) => {
                        log::error!("invalid processFiles payload: {e}");
                        UploadResult::failed(format_error_message(&ErrorValue::from(
                            CoreError::from(e),
                        )))
                    }
                }
            }
        }
    }

    /// Validate tokens, upload `files` and publish the result.
    ///
    /// Always produces a result; the same result is broadcast and persisted.
    pub async fn handle_processing(&self, files: &[FileInput], tokens: &TokenSet) -> UploadResult {
        let result = match self.process(files, tokens).await {
            Ok(result) => result,
            Err(e) => UploadResult::failed(format_error_message(&ErrorValue::from(e))),
        };
        self.publish(&result);
        result
    }

    async fn process(
        &self,
        files: &[FileInput],
        tokens: &TokenSet,
    ) -> Result<UploadResult, CoreError> {
        let Some(complete) = tokens.as_complete() else {
            return Err(CoreError::Validation(MISSING_TOKENS_MESSAGE.to_string()));
        };
        let client = EmojiUploader::from_tokens(complete, self.settings.clone())?;
        log::info!("uploading {} file(s)", files.len());
        Ok(client.upload_files(files).await)
    }

    fn publish(&self, result: &UploadResult) {
        self.notifier.notify(&ProcessUpdate::from(result));

        let state = ProcessingState::from(result);
        match serde_json::to_value(&state) {
            Ok(value) => {
                let mut items = Map::new();
                items.insert(ProcessingState::STORAGE_KEY.to_string(), value);
                if let Err(e) = self.storage.set(items) {
                    log::error!("failed to persist processing state: {e}");
                }
            }
            Err(e) => log::error!("failed to encode processing state: {e}"),
        }
    }

    /// The state persisted by the most recent processing attempt.
    #[must_use]
    pub fn last_state(&self) -> Option<ProcessingState> {
        let value = match self.storage.get(ProcessingState::STORAGE_KEY) {
            Ok(value) => value?,
            Err(e) => {
                log::error!("failed to read processing state: {e}");
                return None;
            }
        };
        serde_json::from_value(value)
            .map_err(|e| log::warn!("ignoring unreadable processing state: {e}"))
            .ok()
    }
}
