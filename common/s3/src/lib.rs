//! S3 client abstraction used by the archiver's storage sink.
//!
//! Trait-based so the sink can be driven by the in-memory `MockS3Client` in tests,
//! with `S3Impl` wrapping `aws-sdk-s3` for real buckets (AWS, MinIO, other gateways).
//! Every failure is mapped onto `S3Error`, which knows whether it is worth retrying.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S3Error {
    #[error("Bucket or object not found: {0}")]
    NotFound(String),
    #[error("Object already exists: {0}")]
    AlreadyExists(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Request throttled: {0}")]
    Throttled(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("S3 operation failed: {0}")]
    OperationFailed(String),
}

impl S3Error {
    /// Throttling, timeouts, 5xx responses and connection failures can succeed on a later
    /// attempt. Everything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            S3Error::Throttled(_) | S3Error::Timeout(_) | S3Error::OperationFailed(_)
        )
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            S3Error::NotFound(_) => "not_found",
            S3Error::AlreadyExists(_) => "already_exists",
            S3Error::AccessDenied(_) => "access_denied",
            S3Error::Throttled(_) => "throttled",
            S3Error::Timeout(_) => "timeout",
            S3Error::InvalidRequest(_) => "invalid_request",
            S3Error::OperationFailed(_) => "operation_failed",
        }
    }
}

/// Maps an HTTP status and S3 error code onto an `S3Error`.
pub fn classify_status(status: u16, code: Option<&str>, message: String) -> S3Error {
    match (status, code) {
        (_, Some("SlowDown")) | (429, _) | (503, _) => S3Error::Throttled(message),
        (_, Some("RequestTimeout")) | (408, _) => S3Error::Timeout(message),
        (_, Some("NoSuchBucket")) | (404, _) => S3Error::NotFound(message),
        (412, _) => S3Error::AlreadyExists(message),
        (401, _) | (403, _) => S3Error::AccessDenied(message),
        // concurrent conditional writes on the same key, safe to try again
        (409, _) => S3Error::OperationFailed(message),
        (400..=499, _) => S3Error::InvalidRequest(message),
        _ => S3Error::OperationFailed(message),
    }
}

fn classify_sdk_error<E>(err: SdkError<E>, context: &str) -> S3Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{context}: {}", aws_sdk_s3::error::DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => S3Error::Timeout(message),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => S3Error::Timeout(message),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            S3Error::OperationFailed(message)
        }
        SdkError::ConstructionFailure(_) => S3Error::InvalidRequest(message),
        SdkError::ServiceError(service_err) => classify_status(
            service_err.raw().status().as_u16(),
            service_err.err().code(),
            message,
        ),
        _ => S3Error::OperationFailed(message),
    }
}

/// S3 client trait that both real and mock implementations use
#[async_trait]
pub trait S3Client: Send + Sync {
    /// Write a whole object in a single request. With `if_absent` the write is rejected
    /// with `S3Error::AlreadyExists` when the key is already taken.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        if_absent: bool,
    ) -> Result<(), S3Error>;

    /// Check that the bucket exists and is reachable with the configured credentials.
    async fn head_bucket(&self, bucket: &str) -> Result<(), S3Error>;
}

/// Connection settings for `S3Impl`.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub attempt_timeout: Duration,
}

/// Real S3 client implementation
pub struct S3Impl {
    client: AwsS3SdkClient,
}

impl S3Impl {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    /// Build a client from explicit settings.
    ///
    /// Explicit credentials take priority, otherwise the default AWS chain is used
    /// (env vars, IRSA web identity, instance profile). SDK-level retries are disabled:
    /// callers own the retry budget.
    pub async fn from_config(config: &S3Config) -> Self {
        let region = Region::new(config.region.clone());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_attempt_timeout(config.attempt_timeout)
                    .build(),
            )
            .retry_config(RetryConfig::disabled())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .region(region)
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            info!("Using explicit S3 credentials from config");
            builder =
                builder.credentials_provider(Credentials::new(access_key, secret_key, None, None, "env"));
        }

        info!(
            region = config.region,
            endpoint = config.endpoint,
            force_path_style = config.force_path_style,
            "S3 client initialized"
        );

        Self::new(AwsS3SdkClient::from_conf(builder.build()))
    }
}

#[async_trait]
impl S3Client for S3Impl {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        if_absent: bool,
    ) -> Result<(), S3Error> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body));

        if if_absent {
            request = request.if_none_match("*");
        }

        request
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, &format!("put s3://{bucket}/{key}")))?;
        Ok(())
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, &format!("head bucket {bucket}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum InjectedFailure {
    /// Request fails before anything is stored
    Reject(S3Error),
    /// Object is stored but the caller sees an error, as when a response is lost
    LandThenFail(S3Error),
}

#[derive(Default)]
struct MockState {
    buckets: Vec<String>,
    objects: HashMap<(String, String), Bytes>,
    put_failures: VecDeque<InjectedFailure>,
    put_attempts: usize,
}

/// In-memory S3 for tests - always available, no conditional compilation needed.
///
/// Clones share the same storage, so a test can keep one handle and inspect the
/// objects written through another.
#[derive(Clone, Default)]
pub struct MockS3Client {
    state: Arc<Mutex<MockState>>,
}

impl MockS3Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.lock().buckets.push(bucket.to_string());
        self
    }

    /// The next `put_object` call fails with `error` without storing anything.
    pub fn fail_next_put(&self, error: S3Error) {
        self.lock()
            .put_failures
            .push_back(InjectedFailure::Reject(error));
    }

    /// The next `put_object` call stores the object and then reports `error`.
    pub fn fail_next_put_after_write(&self, error: S3Error) {
        self.lock()
            .put_failures
            .push_back(InjectedFailure::LandThenFail(error));
    }

    pub fn put_attempts(&self) -> usize {
        self.lock().put_attempts
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a panicking test thread is the only way to poison this
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl S3Client for MockS3Client {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
        if_absent: bool,
    ) -> Result<(), S3Error> {
        let mut state = self.lock();
        state.put_attempts += 1;

        let failure = state.put_failures.pop_front();
        if let Some(InjectedFailure::Reject(e)) = failure {
            return Err(e);
        }
        if !state.buckets.iter().any(|b| b == bucket) {
            return Err(S3Error::NotFound(bucket.to_string()));
        }

        let object_key = (bucket.to_string(), key.to_string());
        if if_absent && state.objects.contains_key(&object_key) {
            return Err(S3Error::AlreadyExists(key.to_string()));
        }
        state.objects.insert(object_key, body);

        match failure {
            Some(InjectedFailure::LandThenFail(e)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        if self.lock().buckets.iter().any(|b| b == bucket) {
            Ok(())
        } else {
            Err(S3Error::NotFound(bucket.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let msg = || "boom".to_string();

        assert_eq!(classify_status(503, None, msg()), S3Error::Throttled(msg()));
        assert_eq!(
            classify_status(400, Some("SlowDown"), msg()),
            S3Error::Throttled(msg())
        );
        assert_eq!(
            classify_status(400, Some("RequestTimeout"), msg()),
            S3Error::Timeout(msg())
        );
        assert_eq!(classify_status(412, None, msg()), S3Error::AlreadyExists(msg()));
        assert_eq!(classify_status(403, None, msg()), S3Error::AccessDenied(msg()));
        assert_eq!(
            classify_status(404, Some("NoSuchBucket"), msg()),
            S3Error::NotFound(msg())
        );
        assert_eq!(classify_status(400, None, msg()), S3Error::InvalidRequest(msg()));
        assert_eq!(classify_status(500, None, msg()), S3Error::OperationFailed(msg()));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(S3Error::Throttled("x".into()).is_retryable());
        assert!(S3Error::Timeout("x".into()).is_retryable());
        assert!(S3Error::OperationFailed("x".into()).is_retryable());

        assert!(!S3Error::AccessDenied("x".into()).is_retryable());
        assert!(!S3Error::NotFound("x".into()).is_retryable());
        assert!(!S3Error::AlreadyExists("x".into()).is_retryable());
        assert!(!S3Error::InvalidRequest("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_mock_put_and_get() {
        let client = MockS3Client::new().with_bucket("archive");

        client
            .put_object("archive", "a/b.parquet", Bytes::from_static(b"data"), "x", true)
            .await
            .unwrap();

        assert_eq!(client.keys("archive"), vec!["a/b.parquet".to_string()]);
        assert_eq!(
            client.get("archive", "a/b.parquet"),
            Some(Bytes::from_static(b"data"))
        );
        assert_eq!(client.put_attempts(), 1);
    }

    #[tokio::test]
    async fn test_mock_if_absent_rejects_existing_key() {
        let client = MockS3Client::new().with_bucket("archive");
        let body = Bytes::from_static(b"data");

        client
            .put_object("archive", "k", body.clone(), "x", true)
            .await
            .unwrap();
        let second = client.put_object("archive", "k", body, "x", true).await;

        assert!(matches!(second, Err(S3Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_mock_unknown_bucket() {
        let client = MockS3Client::new();

        let put = client
            .put_object("missing", "k", Bytes::new(), "x", false)
            .await;
        assert!(matches!(put, Err(S3Error::NotFound(_))));
        assert!(matches!(
            client.head_bucket("missing").await,
            Err(S3Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_injected_failures() {
        let client = MockS3Client::new().with_bucket("archive");
        client.fail_next_put(S3Error::Throttled("slow down".into()));
        client.fail_next_put_after_write(S3Error::Timeout("lost response".into()));

        let first = client
            .put_object("archive", "one", Bytes::from_static(b"1"), "x", true)
            .await;
        assert!(matches!(first, Err(S3Error::Throttled(_))));
        assert!(client.keys("archive").is_empty());

        let second = client
            .put_object("archive", "two", Bytes::from_static(b"2"), "x", true)
            .await;
        assert!(matches!(second, Err(S3Error::Timeout(_))));
        assert_eq!(client.keys("archive"), vec!["two".to_string()]);

        client
            .put_object("archive", "three", Bytes::from_static(b"3"), "x", true)
            .await
            .unwrap();
        assert_eq!(client.put_attempts(), 3);
    }
}
