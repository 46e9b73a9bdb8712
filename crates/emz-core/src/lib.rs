//! Core library for emz - upload custom emoji to Microsoft Teams.
//!
//! This crate provides:
//! - Configuration loading and management
//! - XDG-compliant path resolution
//! - Schema and example config generation
//! - Token extraction from Teams web storage
//! - The three-step custom emoji upload client
//! - The processing orchestrator that relays and persists results
//! - Common types and error handling

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod schema;
pub mod storage;
pub mod teams;

pub use config::{
    AppConfig, EndpointsConfig, LogLevel, LoggingConfig, PathsConfig, RuntimeConfig, UploadConfig,
};
pub use error::{CoreError, Result};
pub use orchestrator::{
    ErrorValue, InboundMessage, LogNotifier, Notifier, Orchestrator, format_error_message,
};
pub use paths::{AppPaths, default_data_dir, default_state_dir};
pub use schema::{generate_example_config, generate_schema, write_generated_files};
pub use storage::{ExtensionStorage, JsonFileStorage, LocalStorageSnapshot, MemoryStorage, PageStorage};
pub use teams::{
    BatchPolicy, EmojiUploader, FileInput, FileOutcome, ProcessUpdate, ProcessingState,
    StatusKind, TokenSet, TokenStore, UploadReport, UploadResult, UploadSettings,
};

/// Application name used for config directories and environment prefix.
pub const APP_NAME: &str = "emz";

/// Returns the environment variable prefix for this application.
#[must_use]
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
