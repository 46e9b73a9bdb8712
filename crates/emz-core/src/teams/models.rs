//! Data models for Teams custom emoji uploads.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Tokens harvested from a Teams web session.
///
/// All three must be present before an upload is attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    /// Bearer token for the chat service aggregator (metadata call).
    #[serde(alias = "chatsvcagg")]
    pub chat_token: Option<String>,
    /// Bearer token for the async object service (object creation and content upload).
    #[serde(alias = "ic3")]
    pub identity_token: Option<String>,
    /// Tenant identifier embedded in the object permission claim.
    pub permissions_id: Option<String>,
}

/// Borrowed view of a [`TokenSet`] with every field present.
#[derive(Debug, Clone, Copy)]
pub struct CompleteTokens<'a> {
    /// Chat service token.
    pub chat_token: &'a str,
    /// Identity (object service) token.
    pub identity_token: &'a str,
    /// Tenant identifier.
    pub permissions_id: &'a str,
}

impl TokenSet {
    /// Whether both bearer tokens have been found.
    ///
    /// Token scans stop once this holds. Empty strings count as missing.
    #[must_use]
    pub fn has_bearer_tokens(&self) -> bool {
        present(self.chat_token.as_ref()).is_some()
            && present(self.identity_token.as_ref()).is_some()
    }

    /// Return all three values if present and non-empty.
    #[must_use]
    pub fn as_complete(&self) -> Option<CompleteTokens<'_>> {
        Some(CompleteTokens {
            chat_token: present(self.chat_token.as_ref())?,
            identity_token: present(self.identity_token.as_ref())?,
            permissions_id: present(self.permissions_id.as_ref())?,
        })
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}

/// A file selected for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInput {
    /// File name, including extension.
    pub name: String,
    /// Size in bytes. Informational only.
    #[serde(default)]
    pub size: u64,
    /// MIME type. Informational only.
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Base64-encoded file content.
    #[serde(rename = "base64")]
    pub content: String,
}

impl FileInput {
    /// Build a file input from raw bytes.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            mime_type: mime_type.into(),
            content: STANDARD.encode(bytes),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or has no usable name.
    pub async fn from_path(path: &Path) -> Result<Self, CoreError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::Path(format!("invalid file name: {}", path.display())))?
            .to_string();

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let bytes = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(name, mime_for_ext(&ext), &bytes))
    }

    /// Decode the base64 payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not valid base64.
    pub fn bytes(&self) -> Result<Vec<u8>, CoreError> {
        STANDARD
            .decode(self.content.trim())
            .map_err(|e| CoreError::Serialization(format!("decoding {}: {e}", self.name)))
    }

    /// Emoji shortcut derived from the file name: everything before the first `.`.
    #[must_use]
    pub fn shortcut(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }
}

/// Map an image file extension to a MIME type.
fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Aggregate outcome of one processing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// Whether the batch is considered successful.
    pub success: bool,
    /// Error message shown to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl UploadResult {
    /// A successful result with a status line.
    #[must_use]
    pub fn succeeded(status: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            status: Some(status.into()),
        }
    }

    /// A failed result with an error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status: None,
        }
    }

    /// Text to display: the error if present, else the status.
    #[must_use]
    pub fn display_text(&self) -> &str {
        self.error
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or_default()
    }
}

/// Kind of the last persisted processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// The last request succeeded.
    Success,
    /// The last request failed.
    Error,
}

/// Snapshot of the most recent [`UploadResult`], persisted under
/// [`ProcessingState::STORAGE_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    /// Status or error text.
    pub status: String,
    /// Whether the request succeeded.
    #[serde(alias = "type")]
    pub kind: StatusKind,
}

impl ProcessingState {
    /// Storage key of the persisted state.
    pub const STORAGE_KEY: &str = "processingState";
}

impl From<&UploadResult> for ProcessingState {
    fn from(result: &UploadResult) -> Self {
        Self {
            status: result.display_text().to_string(),
            kind: if result.success {
                StatusKind::Success
            } else {
                StatusKind::Error
            },
        }
    }
}

/// Notification broadcast after every processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "processUpdate")]
pub struct ProcessUpdate {
    /// Mirrors [`UploadResult::success`].
    pub success: bool,
    /// Mirrors [`UploadResult::status`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Mirrors [`UploadResult::error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&UploadResult> for ProcessUpdate {
    fn from(result: &UploadResult) -> Self {
        Self {
            success: result.success,
            status: result.status.clone(),
            error: result.error.clone(),
        }
    }
}

/// Result of uploading a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    /// File name.
    pub name: String,
    /// Shortcut registered for the emoji.
    pub shortcut: String,
    /// Remote object id, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Failure reason, if any step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    /// Whether all three steps completed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// How per-file failures affect the batch result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum BatchPolicy {
    /// Report success once every file has been attempted, whatever happened to each.
    #[default]
    BestEffort,
    /// Report failure if any file failed.
    AllOrNothing,
}

/// Per-file outcomes of a batch, in upload order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// One entry per input file.
    pub outcomes: Vec<FileOutcome>,
}

impl UploadReport {
    /// Status line of a successful batch.
    pub const SUCCESS_STATUS: &str = "Your emojis have been uploaded";

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Collapse the report into a single result under `policy`.
    #[must_use]
    pub fn to_result(&self, policy: BatchPolicy) -> UploadResult {
        let failed: Vec<&str> = self.failures().map(|o| o.name.as_str()).collect();
        match policy {
            BatchPolicy::AllOrNothing if !failed.is_empty() => UploadResult::failed(format!(
                "{} of {} emojis failed to upload: {}",
                failed.len(),
                self.outcomes.len(),
                failed.join(", ")
            )),
            _ => UploadResult::succeeded(Self::SUCCESS_STATUS),
        }
    }
}
