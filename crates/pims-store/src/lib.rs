//! Job lifecycle management, upload file storage, and HTTP plumbing for
//! downstream collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use pims_core::{FileKind, IngestionJob, IngestionStatus, VerificationFailure};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pims-store";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: IngestionStatus,
        to: IngestionStatus,
    },
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: IngestionStatus,
    },
    #[error("{0}")]
    InvalidArgument(String),
    #[error("job store unavailable: {0}")]
    Store(#[source] anyhow::Error),
}

pub type JobMutation = Box<dyn FnOnce(&mut IngestionJob) -> Result<(), JobError> + Send>;

/// Persistence contract for ingestion jobs. `update` must apply the
/// mutation atomically per job id: concurrent workers never interleave a
/// read-modify-write on the same job, and a mutation that errors leaves the
/// stored job untouched.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: IngestionJob) -> Result<(), JobError>;
    async fn get(&self, job_id: &str) -> Result<IngestionJob, JobError>;
    async fn update(&self, job_id: &str, mutation: JobMutation) -> Result<IngestionJob, JobError>;
}

/// Map-backed job store. One lock over the whole table keeps per-job
/// updates serialized; jobs for different files remain independent values.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, IngestionJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: IngestionJob) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<IngestionJob, JobError> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    async fn update(&self, job_id: &str, mutation: JobMutation) -> Result<IngestionJob, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let mut staged = job.clone();
        mutation(&mut staged)?;
        *job = staged.clone();
        Ok(staged)
    }
}

/// Owns job state and progress counters. All lifecycle rules live here;
/// stores only persist.
///
/// Invariant carried by callers: once `total_records` is set,
/// `processed_records` stays at or below it. Progress increments are plain
/// additions, so a caller must report each record at most once.
#[derive(Clone)]
pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Create a job for a stored upload. Jobs always start in `Uploaded`.
    pub async fn create_job(
        &self,
        insurer_id: &str,
        file_path: &str,
        file_kind: FileKind,
        uploaded_by: &str,
    ) -> Result<String, JobError> {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let job = IngestionJob {
            job_id: job_id.clone(),
            insurer_id: insurer_id.to_string(),
            file_path: file_path.to_string(),
            file_kind,
            status: IngestionStatus::Uploaded,
            total_records: 0,
            processed_records: 0,
            uploaded_by: uploaded_by.to_string(),
            failure_reason: None,
            verification_failures: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(job).await?;
        info!(job_id = job_id.as_str(), insurer_id, "job created in UPLOADED");
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<IngestionJob, JobError> {
        self.store.get(job_id).await
    }

    pub async fn set_total_records(&self, job_id: &str, total: u32) -> Result<(), JobError> {
        self.store
            .update(
                job_id,
                Box::new(move |job| {
                    if job.status.is_terminal() {
                        return Err(JobError::InvalidState {
                            operation: "set total records",
                            state: job.status,
                        });
                    }
                    job.total_records = total;
                    job.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        debug!(job_id, total, "total records set");
        Ok(())
    }

    /// Add `delta` to the processed-record counter. Only legal while the
    /// job is `Processing`, and only with a strictly positive delta.
    pub async fn increment_progress(&self, job_id: &str, delta: u32) -> Result<(), JobError> {
        if delta == 0 {
            return Err(JobError::InvalidArgument(
                "progress delta must be strictly positive".to_string(),
            ));
        }
        let job = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    if job.status != IngestionStatus::Processing {
                        return Err(JobError::InvalidState {
                            operation: "update progress",
                            state: job.status,
                        });
                    }
                    job.processed_records += delta;
                    job.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        debug!(
            job_id,
            processed = job.processed_records,
            total = job.total_records,
            "progress updated"
        );
        Ok(())
    }

    /// Move the job along the state machine. Anything outside
    /// `UPLOADED -> PROCESSING -> {COMPLETED, FAILED}` is rejected and the
    /// job is left unchanged.
    pub async fn transition(
        &self,
        job_id: &str,
        next: IngestionStatus,
        failure_reason: Option<String>,
    ) -> Result<(), JobError> {
        let job = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    if !job.status.allows_transition_to(next) {
                        return Err(JobError::InvalidTransition {
                            from: job.status,
                            to: next,
                        });
                    }
                    job.status = next;
                    job.failure_reason = failure_reason;
                    job.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        info!(job_id, status = %job.status, "status transition");
        Ok(())
    }

    /// Diagnostic data, not lifecycle-gating: appends in any state.
    pub async fn append_verification_failures(
        &self,
        job_id: &str,
        entries: Vec<VerificationFailure>,
    ) -> Result<(), JobError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store
            .update(
                job_id,
                Box::new(move |job| {
                    job.verification_failures.extend(entries);
                    job.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable storage for uploaded insurer files, hash-addressed per
/// insurer so a re-upload of identical bytes lands on the same path.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn upload_relative_path(
        &self,
        insurer_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(insurer_id).join(format!("{content_hash}.{ext}"))
    }

    /// Store an upload immutably at its hash-addressed path. Writes go
    /// through a hidden temp file and an atomic rename; identical bytes for
    /// the same insurer resolve to the already-stored file.
    pub async fn store_bytes(
        &self,
        insurer_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredUpload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.upload_relative_path(insurer_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated: bool| StoredUpload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .expect("upload path always has parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating upload directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking upload path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", &content_hash[..12], Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp upload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp upload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp upload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            // A concurrent upload of the same bytes won the rename.
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp upload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// JSON transport to the customer/policy/portfolio collaborators: bounded
/// concurrency, per-request timeout, exponential backoff on retryable GET
/// failures. POSTs are sent exactly once; the downstream writes are not
/// idempotent.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET a JSON resource. A 404 is `None`, not an error: collaborator
    /// search endpoints use it for "no such record".
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        return Ok(Some(resp.json::<T>().await?));
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// POST a JSON body and decode the JSON response. No retries.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}
