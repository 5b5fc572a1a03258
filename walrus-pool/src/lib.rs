use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};
use url::Url;

/// Content type sent when the caller does not know the MIME type of the payload.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Failover uploader for Walrus publisher mirrors.
///
/// The pool tries each mirror in the configured order until one of them
/// returns a usable blob id. Mirrors are treated as independent replicas of
/// the same store: nothing learned from one attempt is carried over to the
/// next, and every upload starts again at the first mirror.
///
/// Attempts are strictly sequential. There is no timeout beyond the one of
/// the underlying HTTP client, so a hung mirror holds up the whole upload.
#[derive(Debug, Clone)]
pub struct MirrorPool {
    mirrors: Vec<Url>,
    config: MirrorPoolConfig,
    client: Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPoolConfig {
    /// Number of storage epochs requested for every stored blob.
    pub epochs: u32,
}

impl Default for MirrorPoolConfig {
    fn default() -> Self {
        Self { epochs: 1 }
    }
}

impl MirrorPool {
    /// Create a new pool from a list of mirror base URLs with default configuration.
    pub fn new(mirrors: Vec<Url>) -> Result<Self, UploadError> {
        Self::new_with_config(mirrors, MirrorPoolConfig::default())
    }

    pub fn new_with_config(
        mirrors: Vec<Url>,
        config: MirrorPoolConfig,
    ) -> Result<Self, UploadError> {
        Self::new_with_client(mirrors, config, Client::new())
    }

    /// Create a new pool that issues its requests through the given client.
    pub fn new_with_client(
        mirrors: Vec<Url>,
        config: MirrorPoolConfig,
        client: Client,
    ) -> Result<Self, UploadError> {
        if mirrors.is_empty() {
            return Err(UploadError::NoMirrors);
        }

        debug!(
            mirrors = ?mirrors.iter().map(Url::as_str).collect::<Vec<_>>(),
            mirror_count = mirrors.len(),
            epochs = config.epochs,
            "Initializing Walrus mirror pool"
        );

        Ok(Self {
            mirrors,
            config,
            client,
        })
    }

    pub fn mirrors(&self) -> &[Url] {
        &self.mirrors
    }

    pub fn config(&self) -> &MirrorPoolConfig {
        &self.config
    }

    /// Store `payload` on the first mirror that accepts it and return its blob id.
    ///
    /// A mirror counts as failed if the request cannot be sent, the response
    /// status is not a success, or the response body does not contain a blob
    /// id in any of the known shapes. If every mirror fails, the returned
    /// error holds one entry per attempt in the order they were made.
    #[instrument(level = "debug", skip(self, payload), fields(total_mirrors = self.mirrors.len()))]
    pub async fn upload(
        &self,
        payload: impl Into<Bytes>,
        content_type: Option<&str>,
    ) -> Result<BlobId, UploadError> {
        let payload = payload.into();
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        let mut failures = Vec::new();

        for (idx, mirror) in self.mirrors.iter().enumerate() {
            let start = Instant::now();

            match self.attempt(mirror, payload.clone(), content_type).await {
                Ok(blob_id) => {
                    debug!(
                        mirror = %mirror,
                        attempt = idx,
                        duration_ms = start.elapsed().as_millis(),
                        %blob_id,
                        "Blob stored"
                    );

                    return Ok(blob_id);
                }
                Err(error) => {
                    warn!(
                        mirror = %mirror,
                        attempt = idx,
                        duration_ms = start.elapsed().as_millis(),
                        %error,
                        "Upload to mirror failed, trying next mirror"
                    );

                    failures.push(MirrorFailure {
                        mirror: mirror.clone(),
                        error,
                    });
                }
            }
        }

        let context = format!(
            "All {} upload mirrors failed for a {} byte payload",
            self.mirrors.len(),
            payload.len()
        );

        Err(MultiError::new(failures, context).into())
    }

    async fn attempt(
        &self,
        mirror: &Url,
        payload: Bytes,
        content_type: &str,
    ) -> Result<BlobId, AttemptError> {
        let endpoint = blobs_endpoint(mirror, self.config.epochs)?;
        trace!(%endpoint, size = payload.len(), content_type, "Sending blob");

        let response = self
            .client
            .put(endpoint)
            .header(CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AttemptError::Status { status, body });
        }

        serde_json::from_str::<StoreResponse>(&body)
            .ok()
            .and_then(StoreResponse::into_blob_id)
            .ok_or(AttemptError::UnrecognizedResponse(body))
    }
}

/// Build `<mirror>/v1/blobs?epochs=<n>`, keeping any path prefix of the mirror.
fn blobs_endpoint(mirror: &Url, epochs: u32) -> Result<Url, AttemptError> {
    let mut endpoint = mirror.clone();

    endpoint
        .path_segments_mut()
        .map_err(|()| AttemptError::InvalidEndpoint)?
        .pop_if_empty()
        .extend(["v1", "blobs"]);
    endpoint
        .query_pairs_mut()
        .clear()
        .append_pair("epochs", &epochs.to_string());

    Ok(endpoint)
}

/// Opaque identifier of a blob in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<BlobId> for String {
    fn from(blob_id: BlobId) -> Self {
        blob_id.0
    }
}

/// Body of a successful store request.
///
/// Publishers answer with `newlyCreated` for fresh blobs and
/// `alreadyCertified` for content they already hold. Some mirrors reply with
/// a bare `blobId` instead.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreResponse {
    newly_created: Option<NewlyCreated>,
    already_certified: Option<AlreadyCertified>,
    blob_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewlyCreated {
    blob_object: Option<BlobObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobObject {
    blob_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlreadyCertified {
    blob_id: Option<String>,
}

impl StoreResponse {
    fn into_blob_id(self) -> Option<BlobId> {
        self.newly_created
            .and_then(|created| created.blob_object)
            .and_then(|object| object.blob_id)
            .or_else(|| self.already_certified.and_then(|c| c.blob_id))
            .or(self.blob_id)
            .filter(|id| !id.is_empty())
            .map(BlobId)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No upload mirrors configured")]
    NoMirrors,
    #[error(transparent)]
    AllMirrorsFailed(#[from] MultiError),
}

impl UploadError {
    /// The individual mirror failures, empty if no upload was attempted.
    pub fn failures(&self) -> &[MirrorFailure] {
        match self {
            UploadError::NoMirrors => &[],
            UploadError::AllMirrorsFailed(multi_error) => multi_error.failures(),
        }
    }
}

/// Why a single mirror did not produce a blob id.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("Mirror URL cannot be used as a base URL")]
    InvalidEndpoint,
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Mirror responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Mirror response did not contain a blob id: {0}")]
    UnrecognizedResponse(String),
}

#[derive(Debug)]
pub struct MirrorFailure {
    pub mirror: Url,
    pub error: AttemptError,
}

impl fmt::Display for MirrorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.mirror, self.error)
    }
}

/// Every failure of one upload, in the order the mirrors were tried.
#[derive(Debug)]
pub struct MultiError {
    failures: Vec<MirrorFailure>,
    context: String,
}

impl MultiError {
    pub fn new(failures: Vec<MirrorFailure>, context: impl Into<String>) -> Self {
        Self {
            failures,
            context: context.into(),
        }
    }

    pub fn failures(&self) -> &[MirrorFailure] {
        &self.failures
    }

    /// The failure of the last mirror that was tried.
    pub fn last(&self) -> Option<&MirrorFailure> {
        self.failures.last()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "{}, last error from {}", self.context, last)?,
            None => write!(f, "{}", self.context)?,
        }
        if self.failures.len() > 1 {
            for (i, failure) in self.failures.iter().enumerate() {
                write!(f, "\n  {}: {}", i + 1, failure)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .last()
            .map(|failure| &failure.error as &(dyn std::error::Error + 'static))
    }
}
