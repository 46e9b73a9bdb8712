//! Custom emoji upload client for the internal Teams endpoints.
//!
//! An emoji is uploaded in three calls, strictly in order:
//!
//! 1. Create an image object in the async object service (identity token)
//! 2. PUT the image bytes to the object's `imgpsh` content slot (identity token)
//! 3. Register the object as a custom emoji with its shortcut (chat token)
//!
//! The object service returns an `ms-cv` correlation header on creation that
//! is echoed on the following calls.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER};
use serde::Deserialize;

use crate::CoreError;
use crate::config::{AppConfig, EndpointsConfig};
use crate::teams::models::{
    BatchPolicy, CompleteTokens, FileInput, FileOutcome, UploadReport, UploadResult,
};

/// Origin the Teams web client sends requests from.
const TEAMS_ORIGIN: &str = "https://teams.microsoft.com";

/// Correlation header returned on object creation.
const CORRELATION_HEADER: &str = "ms-cv";

/// Message returned when a batch has no files.
pub const NO_FILES_MESSAGE: &str = "Please select files first";

/// Settings shared by every client built for a processing request.
#[derive(Debug, Clone, Default)]
pub struct UploadSettings {
    /// Remote endpoints.
    pub endpoints: EndpointsConfig,
    /// Optional request timeout.
    pub timeout: Option<Duration>,
    /// Batch result policy.
    pub policy: BatchPolicy,
}

impl From<&AppConfig> for UploadSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            timeout: config.runtime.timeout.map(Duration::from_secs),
            policy: config.upload.policy,
        }
    }
}

/// Response body of the object creation call.
#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

/// A freshly created remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Object id, used as the emoji document id.
    pub id: String,
    /// Correlation token from the `ms-cv` header, empty if absent.
    pub correlation: String,
}

/// Uploads image files as Teams custom emoji.
#[derive(Debug)]
pub struct EmojiUploader {
    http_client: Client,
    identity_token: String,
    chat_token: String,
    permissions_id: String,
    settings: UploadSettings,
}

impl EmojiUploader {
    /// Create a client for one set of tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if HTTP client creation fails.
    pub fn new(
        identity_token: &str,
        chat_token: &str,
        permissions_id: &str,
        settings: UploadSettings,
    ) -> Result<Self, CoreError> {
        let mut builder = Client::builder();
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| CoreError::Other(format!("creating HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            identity_token: identity_token.to_string(),
            chat_token: chat_token.to_string(),
            permissions_id: permissions_id.to_string(),
            settings,
        })
    }

    /// Create a client from a complete token set.
    ///
    /// # Errors
    ///
    /// Returns an error if HTTP client creation fails.
    pub fn from_tokens(
        tokens: CompleteTokens<'_>,
        settings: UploadSettings,
    ) -> Result<Self, CoreError> {
        Self::new(
            tokens.identity_token,
            tokens.chat_token,
            tokens.permissions_id,
            settings,
        )
    }

    fn client_headers(&self) -> Result<HeaderMap, CoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ms-client-version",
            HeaderValue::from_str(&self.settings.endpoints.client_version)
                .map_err(|e| CoreError::Config(format!("invalid client version: {e}")))?,
        );
        headers.insert(ORIGIN, HeaderValue::from_static(TEAMS_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://teams.microsoft.com/"));
        Ok(headers)
    }

    fn objects_url(&self) -> String {
        format!(
            "{}/v1/objects/",
            self.settings.endpoints.object_service.trim_end_matches('/')
        )
    }

    /// Create an empty image object readable by the whole tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the service rejects it, or the
    /// response carries no object id.
    pub async fn create_object(&self) -> Result<RemoteObject, CoreError> {
        let body = serde_json::json!({
            "type": "pish/image",
            "permissions": {
                format!("*:tid:{}", self.permissions_id): ["read"]
            },
            "sharingMode": "Unknown"
        });

        let response = self
            .http_client
            .post(self.objects_url())
            .headers(self.client_headers()?)
            .bearer_auth(&self.identity_token)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Api(format!("creating object: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Api(format!(
                "Failed to create object: {}",
                status_text(status)
            )));
        }

        let correlation = response
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let created: CreatedObject = response
            .json()
            .await
            .map_err(|e| CoreError::Serialization(format!("parsing object response: {e}")))?;

        Ok(RemoteObject {
            id: created.id,
            correlation,
        })
    }

    /// Upload the image bytes into an object's `imgpsh` content slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid base64, the request fails,
    /// or the service rejects it.
    pub async fn upload_content(
        &self,
        object: &RemoteObject,
        file: &FileInput,
    ) -> Result<(), CoreError> {
        let bytes = file.bytes()?;
        let url = format!(
            "{}{}/content/imgpsh",
            self.objects_url(),
            urlencoding::encode(&object.id)
        );
        log::debug!("uploading {} ({} bytes) to {url}", file.name, bytes.len());

        let response = self
            .http_client
            .put(&url)
            .headers(self.client_headers()?)
            .bearer_auth(&self.identity_token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("x-ms-migration", "True")
            .header("x-ms-test-user", "False")
            .header(CORRELATION_HEADER, &object.correlation)
            .body(bytes)
            .send()
            .await
            .map_err(|e| CoreError::Api(format!("uploading content: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Api(format!(
                "Failed to upload image: {} - {text}",
                status_text(status)
            )));
        }

        Ok(())
    }

    /// Register an uploaded object as a custom emoji.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the service rejects it.
    pub async fn send_metadata(
        &self,
        object: &RemoteObject,
        shortcuts: &[&str],
    ) -> Result<(), CoreError> {
        let body = serde_json::json!({
            "shortcuts": shortcuts,
            "documentId": object.id
        });

        let response = self
            .http_client
            .post(&self.settings.endpoints.metadata_url)
            .headers(self.client_headers()?)
            .bearer_auth(&self.chat_token)
            .header(ACCEPT, "application/json")
            .header("x-ms-client-type", "web")
            .header(CORRELATION_HEADER, &object.correlation)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Api(format!("sending metadata: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Api(format!(
                "Failed to create metadata: {}",
                status_text(status)
            )));
        }

        let text = response.text().await.unwrap_or_default();
        log::debug!("metadata response: {text}");
        Ok(())
    }

    /// Run the three upload steps for one file.
    ///
    /// Never fails: a step error is logged and recorded in the outcome, and the
    /// remaining steps are skipped.
    pub async fn upload_file(&self, file: &FileInput) -> FileOutcome {
        let shortcut = file.shortcut();
        let mut outcome = FileOutcome {
            name: file.name.clone(),
            shortcut: shortcut.to_string(),
            document_id: None,
            error: None,
        };

        let result: Result<(), CoreError> = async {
            let object = self.create_object().await?;
            log::debug!("document id: {}", object.id);
            outcome.document_id = Some(object.id.clone());
            self.upload_content(&object, file).await?;
            self.send_metadata(&object, &[shortcut]).await
        }
        .await;

        match result {
            Ok(()) => log::info!("uploaded {} as :{shortcut}:", file.name),
            Err(e) => {
                log::error!("error uploading file {}: {e}", file.name);
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Upload every file in order, collecting per-file outcomes.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `files` is empty.
    pub async fn upload_report(&self, files: &[FileInput]) -> Result<UploadReport, CoreError> {
        if files.is_empty() {
            return Err(CoreError::Validation(NO_FILES_MESSAGE.to_string()));
        }

        let mut report = UploadReport::default();
        for file in files {
            report.outcomes.push(self.upload_file(file).await);
        }
        Ok(report)
    }

    /// Upload every file in order and collapse the outcome into one result.
    ///
    /// Under [`BatchPolicy::BestEffort`] the batch succeeds even when single
    /// files failed; their errors only reach the log.
    pub async fn upload_files(&self, files: &[FileInput]) -> UploadResult {
        match self.upload_report(files).await {
            Ok(report) => report.to_result(self.settings.policy),
            Err(e) => UploadResult::failed(e.to_string()),
        }
    }
}

/// Reason phrase of an HTTP status, like `Response.statusText`.
fn status_text(status: reqwest::StatusCode) -> String {
    status
        .canonical_reason()
        .map_or_else(|| status.as_str().to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    const METADATA_PATH: &str = "/api/csa/apac/api/v1/customemoji/metadata";

    fn settings(server: &ServerGuard, policy: BatchPolicy) -> UploadSettings {
        UploadSettings {
            endpoints: EndpointsConfig {
                object_service: server.url(),
                metadata_url: format!("{}{METADATA_PATH}", server.url()),
                client_version: "1415/25021400912".to_string(),
            },
            timeout: Some(Duration::from_secs(5)),
            policy,
        }
    }

    fn uploader(server: &ServerGuard, policy: BatchPolicy) -> EmojiUploader {
        EmojiUploader::new("ic3-token", "chat-token", "tenant-1", settings(server, policy))
            .expect("client")
    }

    fn png(name: &str) -> FileInput {
        FileInput::from_bytes(name, "image/png", b"test")
    }

    #[tokio::test]
    async fn create_object_returns_id_and_correlation() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/objects/")
            .match_header("authorization", "Bearer ic3-token")
            .match_header("x-ms-client-version", "1415/25021400912")
            .match_body(Matcher::Json(json!({
                "type": "pish/image",
                "permissions": {"*:tid:tenant-1": ["read"]},
                "sharingMode": "Unknown"
            })))
            .with_status(201)
            .with_header("ms-cv", "cv-123")
            .with_body(r#"{"id":"0-doc-1"}"#)
            .create_async()
            .await;

        let object = uploader(&server, BatchPolicy::BestEffort)
            .create_object()
            .await
            .expect("create");
        assert_eq!(
            object,
            RemoteObject {
                id: "0-doc-1".to_string(),
                correlation: "cv-123".to_string()
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_correlation_header_is_not_fatal() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/objects/")
            .with_status(200)
            .with_body(r#"{"id":"0-doc-1"}"#)
            .create_async()
            .await;

        let object = uploader(&server, BatchPolicy::BestEffort)
            .create_object()
            .await
            .expect("create");
        assert_eq!(object.correlation, "");
    }

    #[tokio::test]
    async fn create_object_failure_reports_status_text() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/objects/")
            .with_status(401)
            .create_async()
            .await;

        let err = uploader(&server, BatchPolicy::BestEffort)
            .create_object()
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("Failed to create object: Unauthorized"));
    }

    #[tokio::test]
    async fn upload_content_sends_raw_bytes_with_correlation() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/objects/0-doc-1/content/imgpsh")
            .match_header("authorization", "Bearer ic3-token")
            .match_header("ms-cv", "cv-123")
            .match_header("content-type", "application/octet-stream")
            .match_body("test")
            .with_status(201)
            .create_async()
            .await;

        let object = RemoteObject {
            id: "0-doc-1".to_string(),
            correlation: "cv-123".to_string(),
        };
        uploader(&server, BatchPolicy::BestEffort)
            .upload_content(&object, &png("test.png"))
            .await
            .expect("upload");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn upload_content_failure_includes_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v1/objects/0-doc-1/content/imgpsh")
            .with_status(400)
            .with_body("Invalid file format")
            .create_async()
            .await;

        let object = RemoteObject {
            id: "0-doc-1".to_string(),
            correlation: String::new(),
        };
        let err = uploader(&server, BatchPolicy::BestEffort)
            .upload_content(&object, &png("test.png"))
            .await
            .expect_err("should fail");
        assert!(
            err.to_string()
                .contains("Failed to upload image: Bad Request - Invalid file format")
        );
    }

    #[tokio::test]
    async fn send_metadata_uses_chat_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", METADATA_PATH)
            .match_header("authorization", "Bearer chat-token")
            .match_header("x-ms-client-type", "web")
            .match_body(Matcher::Json(json!({
                "shortcuts": ["test"],
                "documentId": "0-doc-1"
            })))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let object = RemoteObject {
            id: "0-doc-1".to_string(),
            correlation: "cv-123".to_string(),
        };
        uploader(&server, BatchPolicy::BestEffort)
            .send_metadata(&object, &["test"])
            .await
            .expect("metadata");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_metadata_failure_reports_status_text() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", METADATA_PATH)
            .with_status(400)
            .create_async()
            .await;

        let object = RemoteObject {
            id: "0-doc-1".to_string(),
            correlation: String::new(),
        };
        let err = uploader(&server, BatchPolicy::BestEffort)
            .send_metadata(&object, &["test"])
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("Failed to create metadata: Bad Request"));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_without_requests() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let result = uploader(&server, BatchPolicy::BestEffort)
            .upload_files(&[])
            .await;
        assert_eq!(result, UploadResult::failed(NO_FILES_MESSAGE));
        mock.assert_async().await;
    }

    type RequestLog = Arc<Mutex<Vec<String>>>;

    /// Respond with `body` and append `label` to `log`.
    fn recording(
        log: &RequestLog,
        label: &'static str,
        body: &'static str,
    ) -> impl Fn(&mockito::Request) -> Vec<u8> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_| {
            log.lock().expect("log lock").push(label.to_string());
            body.as_bytes().to_vec()
        }
    }

    #[tokio::test]
    async fn batch_runs_three_steps_per_file_in_order() {
        let mut server = Server::new_async().await;
        let log = RequestLog::default();

        let created = Arc::new(AtomicUsize::new(0));
        let create = {
            let log = Arc::clone(&log);
            let created = Arc::clone(&created);
            server
                .mock("POST", "/v1/objects/")
                .with_status(201)
                .with_header("ms-cv", "cv")
                .with_body_from_request(move |_| {
                    let n = created.fetch_add(1, Ordering::SeqCst) + 1;
                    log.lock().expect("log lock").push(format!("create doc-{n}"));
                    format!(r#"{{"id":"doc-{n}"}}"#).into_bytes()
                })
                .expect(2)
                .create_async()
                .await
        };
        let content_1 = server
            .mock("PUT", "/v1/objects/doc-1/content/imgpsh")
            .with_status(201)
            .with_body_from_request(recording(&log, "content doc-1", ""))
            .expect(1)
            .create_async()
            .await;
        let content_2 = server
            .mock("PUT", "/v1/objects/doc-2/content/imgpsh")
            .with_status(201)
            .with_body_from_request(recording(&log, "content doc-2", ""))
            .expect(1)
            .create_async()
            .await;
        let metadata_1 = server
            .mock("POST", METADATA_PATH)
            .match_body(Matcher::PartialJson(
                json!({"shortcuts": ["smile"], "documentId": "doc-1"}),
            ))
            .with_status(200)
            .with_body_from_request(recording(&log, "metadata smile", "{}"))
            .expect(1)
            .create_async()
            .await;
        let metadata_2 = server
            .mock("POST", METADATA_PATH)
            .match_body(Matcher::PartialJson(
                json!({"shortcuts": ["wave"], "documentId": "doc-2"}),
            ))
            .with_status(200)
            .with_body_from_request(recording(&log, "metadata wave", "{}"))
            .expect(1)
            .create_async()
            .await;

        let client = uploader(&server, BatchPolicy::BestEffort);
        let files = [png("smile.png"), png("wave.gif")];
        let report = client.upload_report(&files).await.expect("report");

        assert_eq!(
            *log.lock().expect("log lock"),
            [
                "create doc-1",
                "content doc-1",
                "metadata smile",
                "create doc-2",
                "content doc-2",
                "metadata wave",
            ]
        );
        let documents: Vec<Option<&str>> = report
            .outcomes
            .iter()
            .map(|o| o.document_id.as_deref())
            .collect();
        assert_eq!(documents, [Some("doc-1"), Some("doc-2")]);
        assert_eq!(
            report.to_result(BatchPolicy::BestEffort),
            UploadResult::succeeded(UploadReport::SUCCESS_STATUS)
        );

        create.assert_async().await;
        content_1.assert_async().await;
        content_2.assert_async().await;
        metadata_1.assert_async().await;
        metadata_2.assert_async().await;
    }

    #[tokio::test]
    async fn failed_file_still_reports_batch_success() {
        let mut server = Server::new_async().await;
        let create = server
            .mock("POST", "/v1/objects/")
            .with_status(401)
            .create_async()
            .await;
        let later_steps = server
            .mock("PUT", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = uploader(&server, BatchPolicy::BestEffort);
        let result = client.upload_files(&[png("nope.png")]).await;

        // The per-file failure is swallowed: the batch still reports success.
        assert_eq!(result, UploadResult::succeeded(UploadReport::SUCCESS_STATUS));
        create.assert_async().await;
        later_steps.assert_async().await;
    }

    #[tokio::test]
    async fn strict_policy_surfaces_failed_files() {
        let mut server = Server::new_async().await;
        let _create = server
            .mock("POST", "/v1/objects/")
            .with_status(401)
            .create_async()
            .await;

        let outcome = uploader(&server, BatchPolicy::AllOrNothing)
            .upload_file(&png("nope.png"))
            .await;
        assert!(!outcome.is_success());
        assert!(outcome.document_id.is_none());

        let result = uploader(&server, BatchPolicy::AllOrNothing)
            .upload_files(&[png("nope.png")])
            .await;
        assert_eq!(
            result,
            UploadResult::failed("1 of 1 emojis failed to upload: nope.png")
        );
    }
}
