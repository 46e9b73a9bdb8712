//! Teams custom emoji support.
//!
//! This module provides:
//! - Token extraction from Teams web storage
//! - The custom emoji upload client
//! - Request, result and status models

pub mod client;
pub mod models;
pub mod tokens;

pub use client::{EmojiUploader, NO_FILES_MESSAGE, RemoteObject, UploadSettings};
pub use models::{
    BatchPolicy, CompleteTokens, FileInput, FileOutcome, ProcessUpdate, ProcessingState,
    StatusKind, TokenSet, UploadReport, UploadResult,
};
pub use tokens::{EntryDecodeError, StoredSecret, TokenStore};
