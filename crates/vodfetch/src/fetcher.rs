// Segment fetcher: raw retrieval of individual segments with retry logic.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::config::{DownloaderConfig, FetcherConfig};
use crate::error::{FetchAttemptError, FetchError};
use crate::model::SegmentLocator;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// One retrieval attempt against a segment location.
///
/// Implementations hold no per-run state; retries are layered on top by
/// [`Fetcher`].
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_once(&self, location: &str) -> Result<Bytes, FetchAttemptError>;
}

enum ResolvedLocation {
    Remote(Url),
    Local(PathBuf),
}

fn resolve_location(location: &str) -> Result<ResolvedLocation, FetchAttemptError> {
    if location.trim().is_empty() {
        return Err(FetchAttemptError::invalid_location(location, "empty location"));
    }

    match Url::parse(location) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(ResolvedLocation::Remote(url)),
            "file" => url.to_file_path().map(ResolvedLocation::Local).map_err(|_| {
                FetchAttemptError::invalid_location(location, "not a local file URL")
            }),
            // Windows drive letters parse as a one-letter scheme.
            scheme if scheme.len() == 1 => Ok(ResolvedLocation::Local(PathBuf::from(location))),
            scheme => Err(FetchAttemptError::invalid_location(
                location,
                format!("unsupported scheme `{scheme}`"),
            )),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Ok(ResolvedLocation::Local(PathBuf::from(location)))
        }
        Err(e) => Err(FetchAttemptError::invalid_location(location, e.to_string())),
    }
}

/// Fetches segments over HTTP(S), or from disk for `file://` URLs and paths.
pub struct HttpSource {
    http_client: Client,
    streaming_threshold: usize,
}

impl HttpSource {
    /// Builds the client once from `config`; its headers apply to every request.
    pub fn new(
        config: &DownloaderConfig,
        fetcher_config: &FetcherConfig,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(
            config.build_client()?,
            fetcher_config.streaming_threshold_bytes,
        ))
    }

    pub fn with_client(http_client: Client, streaming_threshold: usize) -> Self {
        Self {
            http_client,
            streaming_threshold,
        }
    }

    async fn fetch_remote(&self, url: Url) -> Result<Bytes, FetchAttemptError> {
        let response = self.http_client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchAttemptError::http_status(status, url.as_str()));
        }

        trace!(url = %url, http_version = ?response.version(), "Segment response received");

        // Large bodies are read chunk by chunk to avoid buffering twice.
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.streaming_threshold)
        {
            self.stream_response(response).await
        } else {
            Ok(response.bytes().await?)
        }
    }

    async fn stream_response(
        &self,
        response: reqwest::Response,
    ) -> Result<Bytes, FetchAttemptError> {
        let content_length = response.content_length().unwrap_or(0) as usize;
        let mut buffer = BytesMut::with_capacity(content_length);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        Ok(buffer.freeze())
    }

    async fn fetch_local(&self, path: PathBuf) -> Result<Bytes, FetchAttemptError> {
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(source) => Err(FetchAttemptError::Io { path, source }),
        }
    }
}

#[async_trait]
impl SegmentSource for HttpSource {
    async fn fetch_once(&self, location: &str) -> Result<Bytes, FetchAttemptError> {
        match resolve_location(location)? {
            ResolvedLocation::Remote(url) => self.fetch_remote(url).await,
            ResolvedLocation::Local(path) => self.fetch_local(path).await,
        }
    }
}

/// A [`SegmentSource`] plus the retry policy every fetch of a run shares.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn SegmentSource>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(source: Arc<dyn SegmentSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn from_config(source: Arc<dyn SegmentSource>, config: &FetcherConfig) -> Self {
        Self::new(
            source,
            RetryPolicy::new(config.max_retries, config.retry_delay_unit),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch one locator, retrying up to `max_retries` times.
    #[instrument(skip(self, locator, token), fields(index = locator.index))]
    pub async fn fetch(
        &self,
        locator: &SegmentLocator,
        token: &CancellationToken,
    ) -> Result<Bytes, FetchError> {
        let location = locator.location.as_str();
        let bytes = retry_with_backoff(&self.policy, location, token, |_| async move {
            RetryAction::from(self.source.fetch_once(location).await)
        })
        .await?;

        debug!(size = bytes.len(), "Fetched segment");
        Ok(bytes)
    }
}
