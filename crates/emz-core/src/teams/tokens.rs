//! Token extraction from Teams web storage.
//!
//! The Teams web client keeps MSAL access tokens in `localStorage` under keys
//! that embed the resource name. Two are needed for emoji uploads:
//!
//! - `chatsvcagg` - the chat service aggregator token (metadata call)
//! - `ic3.teams.office` - the identity token for the async object service; its
//!   `realm` is the tenant id used in object permissions
//!
//! Every failure here degrades to missing tokens plus a logged diagnostic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::storage::{ExtensionStorage, PageStorage};
use crate::teams::models::TokenSet;

/// Key substring identifying the chat service token.
pub const CHAT_KEY_MARKER: &str = "chatsvcagg";

/// Key substring identifying the identity service token.
pub const IDENTITY_KEY_MARKER: &str = "ic3.teams.office";

/// Storage key the captured chat token is written under.
pub const CAPTURED_CHAT_KEY: &str = "teams_chatsvcagg";

/// Storage key the captured identity token is written under.
pub const CAPTURED_IDENTITY_KEY: &str = "teams_ic3";

/// Why a single storage entry could not be used.
#[derive(Debug, Error)]
pub enum EntryDecodeError {
    /// The stored string is not JSON.
    #[error("value is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),

    /// The JSON does not have the expected token shape.
    #[error("unexpected token shape: {0}")]
    Shape(serde_json::Error),
}

/// MSAL token record as stored by the Teams web client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    /// The bearer token.
    pub secret: String,
    /// Tenant id, present on identity tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

impl StoredSecret {
    /// Decode a storage value. Strings are parsed as JSON first.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not JSON or has no string `secret`.
    pub fn decode(value: &Value) -> Result<Self, EntryDecodeError> {
        match value {
            Value::String(text) => {
                let parsed: Value =
                    serde_json::from_str(text).map_err(EntryDecodeError::InvalidJson)?;
                Self::deserialize(&parsed).map_err(EntryDecodeError::Shape)
            }
            other => Self::deserialize(other).map_err(EntryDecodeError::Shape),
        }
    }
}

/// Which token a storage key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Chat,
    Identity,
}

impl TokenKind {
    /// Kinds a key refers to. The captured identity key carries no marker, so
    /// it is matched by name.
    fn matching(key: &str) -> impl Iterator<Item = Self> + '_ {
        [
            (CHAT_KEY_MARKER, Self::Chat),
            (IDENTITY_KEY_MARKER, Self::Identity),
        ]
        .into_iter()
        .filter(move |(marker, kind)| {
            key.contains(marker) || (*kind == Self::Identity && key == CAPTURED_IDENTITY_KEY)
        })
        .map(|(_, kind)| kind)
    }
}

/// Stateless helpers that locate tokens in storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenStore;

impl TokenStore {
    /// Collect tokens from the extension's own storage.
    ///
    /// Values may be JSON strings or already-structured objects.
    #[must_use]
    pub fn collect_from_extension_storage(storage: &impl ExtensionStorage) -> TokenSet {
        let mut tokens = TokenSet::default();

        let items = match storage.get_all() {
            Ok(items) => items,
            Err(e) => {
                log::error!("failed to get tokens from storage: {e}");
                return tokens;
            }
        };
        log::debug!("scanning {} storage item(s) for tokens", items.len());

        for (key, value) in &items {
            if let Err(e) = absorb(&mut tokens, key, value) {
                log::error!("failed to parse storage item {key}: {e}");
            }
            if tokens.has_bearer_tokens() {
                break;
            }
        }

        tokens
    }

    /// Collect tokens from a page's `localStorage`, walking it by index.
    #[must_use]
    pub fn collect_from_page_storage(page: &impl PageStorage) -> TokenSet {
        let mut tokens = TokenSet::default();

        let length = match page.length() {
            Ok(length) => length,
            Err(e) => {
                log::error!("error accessing localStorage: {e}");
                return tokens;
            }
        };

        for index in 0..length {
            let key = match page.key(index) {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("failed to read localStorage key {index}: {e}");
                    continue;
                }
            };

            let value = match page.get_item(&key) {
                Ok(Some(value)) if !value.is_empty() => value,
                Ok(_) => continue,
                Err(e) => {
                    log::error!("failed to read localStorage item {key}: {e}");
                    continue;
                }
            };

            if let Err(e) = absorb(&mut tokens, &key, &Value::String(value)) {
                log::error!("failed to parse localStorage item {key}: {e}");
            }
            if tokens.has_bearer_tokens() {
                break;
            }
        }

        tokens
    }

    /// Copy tokens found in page storage into extension storage under fixed keys.
    ///
    /// Nothing is written unless both bearer tokens were found. Failures are
    /// logged, never returned. Returns whether tokens were written.
    #[must_use]
    pub fn capture_and_persist(page: &impl PageStorage, storage: &impl ExtensionStorage) -> bool {
        let tokens = Self::collect_from_page_storage(page);
        let (Some(chat), Some(identity)) = (tokens.chat_token, tokens.identity_token) else {
            log::debug!("page storage does not hold both tokens yet");
            return false;
        };

        let chat = StoredSecret {
            secret: chat,
            realm: None,
        };
        let identity = StoredSecret {
            secret: identity,
            realm: tokens.permissions_id,
        };

        let items = match (serde_json::to_value(chat), serde_json::to_value(identity)) {
            (Ok(chat), Ok(identity)) => {
                let mut items = Map::new();
                items.insert(CAPTURED_CHAT_KEY.to_string(), chat);
                items.insert(CAPTURED_IDENTITY_KEY.to_string(), identity);
                items
            }
            (Err(e), _) | (_, Err(e)) => {
                log::error!("failed to capture and store tokens: {e}");
                return false;
            }
        };

        match storage.set(items) {
            Ok(()) => {
                log::info!("Teams tokens saved to storage");
                true
            }
            Err(e) => {
                log::error!("failed to capture and store tokens: {e}");
                false
            }
        }
    }

    /// Copy every token-bearing page entry into extension storage under its own key.
    ///
    /// Entries are stored parsed; entries that are not JSON are logged and
    /// skipped. Returns the number of entries written.
    #[must_use]
    pub fn import_matching_entries(
        page: &impl PageStorage,
        storage: &impl ExtensionStorage,
    ) -> usize {
        let length = match page.length() {
            Ok(length) => length,
            Err(e) => {
                log::error!("error accessing localStorage: {e}");
                return 0;
            }
        };

        let mut items = Map::new();
        for index in 0..length {
            let Ok(Some(key)) = page.key(index) else {
                continue;
            };
            if TokenKind::matching(&key).next().is_none() {
                continue;
            }
            let value = page.get_item(&key).ok().flatten().unwrap_or_default();
            match serde_json::from_str::<Value>(&value) {
                Ok(parsed) => {
                    log::debug!("stored token: {key}");
                    items.insert(key, parsed);
                }
                Err(e) => log::error!("failed to parse token {key}: {e}"),
            }
        }

        let count = items.len();
        if count == 0 {
            return 0;
        }
        match storage.set(items) {
            Ok(()) => {
                log::info!("Teams tokens captured from page ({count} entries)");
                count
            }
            Err(e) => {
                log::error!("error capturing tokens: {e}");
                0
            }
        }
    }
}

/// Fold one storage entry into `tokens`. Keys matching no marker are ignored.
fn absorb(tokens: &mut TokenSet, key: &str, value: &Value) -> Result<(), EntryDecodeError> {
    let mut kinds = TokenKind::matching(key).peekable();
    if kinds.peek().is_none() {
        return Ok(());
    }

    let stored = StoredSecret::decode(value)?;
    if stored.secret.is_empty() {
        log::debug!("ignoring empty secret in {key}");
        return Ok(());
    }
    for kind in kinds {
        match kind {
            TokenKind::Chat => tokens.chat_token = Some(stored.secret.clone()),
            TokenKind::Identity => {
                tokens.identity_token = Some(stored.secret.clone());
                tokens.permissions_id = stored.realm.clone().filter(|r| !r.is_empty());
            }
        }
    }
    Ok(())
}
