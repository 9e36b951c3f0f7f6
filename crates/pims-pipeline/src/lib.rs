//! Pipeline orchestration: wires the file reader, mapping resolver,
//! matching engine and job lifecycle into one per-job processing run, and
//! exposes the caller-facing upload/status/trigger operations.
//!
//! One worker drives one job to a terminal state; records are handled
//! sequentially so progress counters and failure lists accumulate
//! deterministically. A single record's failure never aborts the job;
//! file-level failures (unreadable file, missing mappings) end it as
//! FAILED with a human-readable reason.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pims_core::{
    CanonicalRecord, CreatedPolicy, Customer, FileKind, IngestionJob, IngestionStatus,
    MatchResult, PolicyData, PolicySnapshot, VerificationFailure,
};
use pims_mapping::{ConfigError, MappingResolver, StaticMappingConfig};
use pims_match::{CustomerDirectory, DirectoryError, MatchEngine};
use pims_store::{
    FetchError, HttpClientConfig, HttpFetcher, InMemoryJobStore, JobError, JobLifecycle,
    UploadStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pims-pipeline";

#[derive(Debug, Error)]
#[error("policy store unavailable: {0}")]
pub struct PolicyStoreError(#[from] pub anyhow::Error);

#[derive(Debug, Error)]
#[error("portfolio store unavailable: {0}")]
pub struct PortfolioStoreError(#[from] pub anyhow::Error);

/// Write side of the policy system of record.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn create_policy(&self, policy: &PolicyData) -> Result<CreatedPolicy, PolicyStoreError>;
}

/// Denormalized per-customer portfolio, updated incrementally after each
/// successful stitch.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    async fn append_policy_snapshot(
        &self,
        customer_id: &str,
        snapshot: PolicySnapshot,
    ) -> Result<(), PortfolioStoreError>;
}

/// Local policy store for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    created: Mutex<Vec<(String, PolicyData)>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn created(&self) -> Vec<(String, PolicyData)> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn create_policy(&self, policy: &PolicyData) -> Result<CreatedPolicy, PolicyStoreError> {
        let policy_id = Uuid::new_v4().to_string();
        let mut created = self.created.lock().await;
        created.push((policy_id.clone(), policy.clone()));
        Ok(CreatedPolicy { policy_id })
    }
}

/// Local portfolio store for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryPortfolioStore {
    portfolios: Mutex<HashMap<String, Vec<PolicySnapshot>>>,
}

impl InMemoryPortfolioStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshots_for(&self, customer_id: &str) -> Vec<PolicySnapshot> {
        self.portfolios
            .lock()
            .await
            .get(customer_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PortfolioStore for InMemoryPortfolioStore {
    async fn append_policy_snapshot(
        &self,
        customer_id: &str,
        snapshot: PolicySnapshot,
    ) -> Result<(), PortfolioStoreError> {
        let mut portfolios = self.portfolios.lock().await;
        portfolios
            .entry(customer_id.to_string())
            .or_default()
            .push(snapshot);
        Ok(())
    }
}

/// Local customer directory, keyed by each strong identifier. Handy for
/// tests and for seeding single-process runs.
#[derive(Default)]
pub struct InMemoryCustomerDirectory {
    by_mobile: std::sync::RwLock<HashMap<String, Customer>>,
    by_email: std::sync::RwLock<HashMap<String, Customer>>,
    by_pan: std::sync::RwLock<HashMap<String, Customer>>,
}

impl InMemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, customer: Customer) {
        if let Some(mobile) = &customer.mobile_number {
            self.by_mobile
                .write()
                .expect("directory lock poisoned")
                .insert(mobile.clone(), customer.clone());
        }
        if let Some(email) = &customer.email {
            self.by_email
                .write()
                .expect("directory lock poisoned")
                .insert(email.clone(), customer.clone());
        }
        if let Some(pan) = &customer.pan_number {
            self.by_pan
                .write()
                .expect("directory lock poisoned")
                .insert(pan.clone(), customer.clone());
        }
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryCustomerDirectory {
    async fn search_by_mobile(&self, mobile: &str) -> Result<Option<Customer>, DirectoryError> {
        Ok(self
            .by_mobile
            .read()
            .expect("directory lock poisoned")
            .get(mobile)
            .cloned())
    }

    async fn search_by_email(&self, email: &str) -> Result<Option<Customer>, DirectoryError> {
        Ok(self
            .by_email
            .read()
            .expect("directory lock poisoned")
            .get(email)
            .cloned())
    }

    async fn search_by_pan(&self, pan: &str) -> Result<Option<Customer>, DirectoryError> {
        Ok(self
            .by_pan
            .read()
            .expect("directory lock poisoned")
            .get(pan)
            .cloned())
    }
}

fn fetch_to_anyhow(err: FetchError) -> anyhow::Error {
    anyhow::Error::new(err)
}

/// Customer directory backed by the customer service's search endpoints.
pub struct HttpCustomerDirectory {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpCustomerDirectory {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CustomerDirectory for HttpCustomerDirectory {
    async fn search_by_mobile(&self, mobile: &str) -> Result<Option<Customer>, DirectoryError> {
        let url = format!("{}/customers/search?mobile={mobile}", self.base_url);
        self.fetcher
            .get_json(&url)
            .await
            .map_err(|e| DirectoryError(fetch_to_anyhow(e)))
    }

    async fn search_by_email(&self, email: &str) -> Result<Option<Customer>, DirectoryError> {
        let url = format!("{}/customers/search?email={email}", self.base_url);
        self.fetcher
            .get_json(&url)
            .await
            .map_err(|e| DirectoryError(fetch_to_anyhow(e)))
    }

    async fn search_by_pan(&self, pan: &str) -> Result<Option<Customer>, DirectoryError> {
        let url = format!("{}/customers/search?pan={pan}", self.base_url);
        self.fetcher
            .get_json(&url)
            .await
            .map_err(|e| DirectoryError(fetch_to_anyhow(e)))
    }
}

/// Policy store backed by the policy service.
pub struct HttpPolicyStore {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpPolicyStore {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PolicyStore for HttpPolicyStore {
    async fn create_policy(&self, policy: &PolicyData) -> Result<CreatedPolicy, PolicyStoreError> {
        let url = format!("{}/policies", self.base_url);
        self.fetcher
            .post_json(&url, policy)
            .await
            .map_err(|e| PolicyStoreError(fetch_to_anyhow(e)))
    }
}

/// Portfolio store backed by the portfolio service.
pub struct HttpPortfolioStore {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpPortfolioStore {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PortfolioStore for HttpPortfolioStore {
    async fn append_policy_snapshot(
        &self,
        customer_id: &str,
        snapshot: PolicySnapshot,
    ) -> Result<(), PortfolioStoreError> {
        let url = format!("{}/portfolios/{customer_id}/policies", self.base_url);
        let _: serde_json::Value = self
            .fetcher
            .post_json(&url, &snapshot)
            .await
            .map_err(|e| PortfolioStoreError(fetch_to_anyhow(e)))?;
        Ok(())
    }
}

/// Upload acceptance policy. Limits are deployment configuration, not core
/// pipeline semantics.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_bytes: usize,
    pub allowed_extensions: Vec<String>,
    pub schema_validation: bool,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            allowed_extensions: vec!["csv".to_string(), "xls".to_string(), "xlsx".to_string()],
            schema_validation: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file is empty or missing")]
    EmptyFile,
    #[error("file name is missing")]
    MissingFilename,
    #[error("invalid file type .{extension}; allowed: {allowed}")]
    InvalidExtension { extension: String, allowed: String },
    #[error("file size {size} exceeds maximum allowed {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("missing required columns: {0}")]
    MissingRequiredColumns(String),
    #[error(transparent)]
    Unreadable(#[from] pims_ingest::ReadError),
    #[error("storing upload: {0}")]
    Storage(#[source] anyhow::Error),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// What one processing run did, in the shape operators read.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub job_id: String,
    pub insurer_id: String,
    pub policy_type: Option<String>,
    pub status: IngestionStatus,
    pub total_records: u32,
    pub created_policies: u32,
    pub verification_failures: u32,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct ProcessStats {
    policy_type: String,
    total_records: u32,
    created_policies: u32,
    verification_failures: u32,
}

pub struct IngestionPipeline {
    lifecycle: JobLifecycle,
    uploads: UploadStore,
    mappings: Arc<MappingResolver>,
    matcher: MatchEngine,
    policies: Arc<dyn PolicyStore>,
    portfolios: Arc<dyn PortfolioStore>,
    limits: UploadLimits,
}

impl IngestionPipeline {
    pub fn new(
        lifecycle: JobLifecycle,
        uploads: UploadStore,
        mappings: Arc<MappingResolver>,
        directory: Arc<dyn CustomerDirectory>,
        policies: Arc<dyn PolicyStore>,
        portfolios: Arc<dyn PortfolioStore>,
    ) -> Self {
        Self {
            lifecycle,
            uploads,
            mappings,
            matcher: MatchEngine::new(directory),
            policies,
            portfolios,
            limits: UploadLimits::default(),
        }
    }

    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn lifecycle(&self) -> &JobLifecycle {
        &self.lifecycle
    }

    /// Validate and persist an upload, then create its job in UPLOADED.
    /// Validation failures surface immediately; no job is created for them.
    pub async fn upload_and_create_job(
        &self,
        filename: &str,
        bytes: &[u8],
        insurer_id: &str,
        uploaded_by: &str,
        file_kind_hint: Option<&str>,
    ) -> Result<String, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::EmptyFile);
        }
        if filename.trim().is_empty() {
            return Err(UploadError::MissingFilename);
        }
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.limits.allowed_extensions.contains(&extension) {
            return Err(UploadError::InvalidExtension {
                extension,
                allowed: self.limits.allowed_extensions.join(", "),
            });
        }
        if bytes.len() > self.limits.max_bytes {
            return Err(UploadError::TooLarge {
                size: bytes.len(),
                max: self.limits.max_bytes,
            });
        }

        let file_kind = FileKind::resolve(file_kind_hint, filename);
        if self.limits.schema_validation && file_kind == FileKind::Normal {
            self.validate_upload_schema(filename, bytes, insurer_id).await?;
        }

        let stored = self
            .uploads
            .store_bytes(insurer_id, &extension, bytes)
            .await
            .map_err(UploadError::Storage)?;
        let job_id = self
            .lifecycle
            .create_job(
                insurer_id,
                &stored.absolute_path.display().to_string(),
                file_kind,
                uploaded_by,
            )
            .await?;
        info!(
            job_id = job_id.as_str(),
            insurer_id,
            filename,
            deduplicated = stored.deduplicated,
            "upload accepted"
        );
        Ok(job_id)
    }

    /// Header check against the insurer's required mappings. Skipped when
    /// the insurer has no resolvable configuration: missing mappings are a
    /// job-level failure at processing time, not an upload rejection.
    async fn validate_upload_schema(
        &self,
        filename: &str,
        bytes: &[u8],
        insurer_id: &str,
    ) -> Result<(), UploadError> {
        let mappings = match self.mappings.resolve_policy_type(insurer_id, None).await {
            Ok(policy_type) => match self.mappings.resolve_mappings(insurer_id, &policy_type).await {
                Ok(mappings) => mappings,
                Err(err) => {
                    debug!(insurer_id, %err, "skipping upload schema validation");
                    return Ok(());
                }
            },
            Err(err) => {
                debug!(insurer_id, %err, "skipping upload schema validation");
                return Ok(());
            }
        };
        let table = pims_ingest::read_table_from_bytes(filename, bytes)?;
        let missing = pims_ingest::missing_required_columns(&table, &mappings);
        if !missing.is_empty() {
            return Err(UploadError::MissingRequiredColumns(missing.join(", ")));
        }
        Ok(())
    }

    /// Job view for operational callers.
    pub async fn get_job_status(&self, job_id: &str) -> Result<IngestionJob, JobError> {
        self.lifecycle.get_job(job_id).await
    }

    /// Run one job to a terminal state.
    ///
    /// Errors are returned only when the run cannot start (unknown job,
    /// illegal transition). Once PROCESSING begins, every failure resolves
    /// to a FAILED job and a summary; nothing propagates past this
    /// boundary.
    pub async fn trigger_processing(
        &self,
        job_id: &str,
        policy_type_hint: Option<&str>,
    ) -> Result<IngestRunSummary, JobError> {
        let job = self.lifecycle.get_job(job_id).await?;
        self.lifecycle
            .transition(job_id, IngestionStatus::Processing, None)
            .await?;
        let started_at = Utc::now();
        info!(job_id, insurer_id = job.insurer_id.as_str(), "processing started");

        match self.process_job(&job, policy_type_hint).await {
            Ok(stats) => {
                self.lifecycle
                    .transition(job_id, IngestionStatus::Completed, None)
                    .await?;
                info!(
                    job_id,
                    total = stats.total_records,
                    created = stats.created_policies,
                    failed = stats.verification_failures,
                    "processing completed"
                );
                Ok(IngestRunSummary {
                    job_id: job_id.to_string(),
                    insurer_id: job.insurer_id.clone(),
                    policy_type: Some(stats.policy_type),
                    status: IngestionStatus::Completed,
                    total_records: stats.total_records,
                    created_policies: stats.created_policies,
                    verification_failures: stats.verification_failures,
                    failure_reason: None,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(job_id, reason = reason.as_str(), "processing failed");
                if let Err(transition_err) = self
                    .lifecycle
                    .transition(job_id, IngestionStatus::Failed, Some(reason.clone()))
                    .await
                {
                    warn!(job_id, %transition_err, "could not record FAILED state");
                }
                let job = self.lifecycle.get_job(job_id).await?;
                Ok(IngestRunSummary {
                    job_id: job_id.to_string(),
                    insurer_id: job.insurer_id.clone(),
                    policy_type: None,
                    status: job.status,
                    total_records: job.total_records,
                    created_policies: job.processed_records,
                    verification_failures: job.verification_failures.len() as u32,
                    failure_reason: job.failure_reason.clone(),
                    started_at,
                    finished_at: Utc::now(),
                })
            }
        }
    }

    async fn process_job(
        &self,
        job: &IngestionJob,
        policy_type_hint: Option<&str>,
    ) -> anyhow::Result<ProcessStats> {
        let policy_type = self
            .mappings
            .resolve_policy_type(&job.insurer_id, policy_type_hint)
            .await
            .map_err(config_to_anyhow)?;
        let mappings = self
            .mappings
            .resolve_mappings(&job.insurer_id, &policy_type)
            .await
            .map_err(config_to_anyhow)?;
        info!(
            job_id = job.job_id.as_str(),
            policy_type = policy_type.as_str(),
            rules = mappings.len(),
            "resolved field mappings"
        );

        let table = pims_ingest::read_table(&job.file_path)?;
        let records = pims_ingest::map_table(&table, &mappings, &job.insurer_id, &policy_type);
        self.lifecycle
            .set_total_records(&job.job_id, records.len() as u32)
            .await?;

        let mut created = 0u32;
        let mut failures = Vec::new();
        for record in &records {
            let policy_number = record
                .policy_number
                .clone()
                .unwrap_or_else(|| "?".to_string());
            match self.process_record(record).await {
                Ok(()) => {
                    created += 1;
                    self.lifecycle.increment_progress(&job.job_id, 1).await?;
                }
                Err(reason) => {
                    debug!(
                        job_id = job.job_id.as_str(),
                        policy_number = policy_number.as_str(),
                        reason = reason.as_str(),
                        "record failed"
                    );
                    failures.push(VerificationFailure {
                        policy_number,
                        reason,
                    });
                }
            }
        }

        let failure_count = failures.len() as u32;
        self.lifecycle
            .append_verification_failures(&job.job_id, failures)
            .await?;

        Ok(ProcessStats {
            policy_type,
            total_records: records.len() as u32,
            created_policies: created,
            verification_failures: failure_count,
        })
    }

    /// One record: resolve identity, create the policy, append the
    /// portfolio snapshot. Any failure becomes this record's reason.
    async fn process_record(&self, record: &CanonicalRecord) -> Result<(), String> {
        let customer_id = match self.matcher.resolve(record).await {
            Ok(MatchResult::Matched { customer_id }) => customer_id,
            Ok(MatchResult::Unmatched { reason }) => return Err(reason),
            Err(err) => return Err(format!("Unexpected error: {err}")),
        };

        let policy = build_policy(record, &customer_id);
        let created = self
            .policies
            .create_policy(&policy)
            .await
            .map_err(|err| format!("Policy creation failed: {err}"))?;

        let snapshot = PolicySnapshot {
            policy_id: created.policy_id,
            policy_number: policy.policy_number.clone(),
            insurer_id: policy.insurer_id.clone(),
            policy_type: policy.policy_type.clone(),
            plan_name: policy.plan_name.clone(),
            premium_amount: policy.premium_amount.clone(),
            sum_assured: policy.sum_assured.clone(),
            start_date: policy.start_date.clone(),
            end_date: policy.end_date.clone(),
            status: policy.status.clone(),
        };
        self.portfolios
            .append_policy_snapshot(&customer_id, snapshot)
            .await
            .map_err(|err| format!("Portfolio update failed: {err}"))?;

        debug!(
            customer_id = customer_id.as_str(),
            policy_number = policy.policy_number.as_str(),
            "policy stitched to customer"
        );
        Ok(())
    }
}

fn config_to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::Error::new(err)
}

fn build_policy(record: &CanonicalRecord, customer_id: &str) -> PolicyData {
    PolicyData {
        policy_number: record.policy_number.clone().unwrap_or_default(),
        customer_id: customer_id.to_string(),
        insurer_id: record.insurer_id.clone(),
        policy_type: record.policy_type.clone(),
        plan_name: record.plan_name.clone(),
        premium_amount: record.premium_amount.clone().unwrap_or_else(|| "0".to_string()),
        sum_assured: record.sum_assured.clone().unwrap_or_else(|| "0".to_string()),
        status: record
            .policy_status
            .clone()
            .unwrap_or_else(|| "ACTIVE".to_string()),
        start_date: record.start_date.clone(),
        end_date: record.end_date.clone(),
    }
}

/// Deployment configuration, read from the environment the way operators
/// run the service.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub upload_dir: PathBuf,
    pub mapping_config_path: PathBuf,
    pub customer_base_url: Option<String>,
    pub policy_base_url: Option<String>,
    pub portfolio_base_url: Option<String>,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            upload_dir: std::env::var("PIMS_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./storage/uploads")),
            mapping_config_path: std::env::var("PIMS_MAPPING_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/insurer-field-mappings.yaml")),
            customer_base_url: std::env::var("PIMS_CUSTOMER_BASE_URL").ok(),
            policy_base_url: std::env::var("PIMS_POLICY_BASE_URL").ok(),
            portfolio_base_url: std::env::var("PIMS_PORTFOLIO_BASE_URL").ok(),
            http_timeout_secs: std::env::var("PIMS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Assemble a pipeline from deployment configuration. Collaborators with a
/// configured base URL go over HTTP; the rest run in-memory (useful for
/// local dry runs, where created policies live only for the process).
pub fn pipeline_from_config(config: &PipelineConfig) -> anyhow::Result<IngestionPipeline> {
    let static_config = if config.mapping_config_path.exists() {
        StaticMappingConfig::from_path(&config.mapping_config_path)?
    } else {
        warn!(
            path = %config.mapping_config_path.display(),
            "mapping config not found; starting with empty static configuration"
        );
        StaticMappingConfig::empty()
    };
    let resolver = Arc::new(MappingResolver::new(static_config));
    let lifecycle = JobLifecycle::new(Arc::new(InMemoryJobStore::new()));
    let uploads = UploadStore::new(&config.upload_dir);

    let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        ..HttpClientConfig::default()
    })?);

    let directory: Arc<dyn CustomerDirectory> = match &config.customer_base_url {
        Some(base) => Arc::new(HttpCustomerDirectory::new(fetcher.clone(), base.clone())),
        None => Arc::new(InMemoryCustomerDirectory::new()),
    };
    let policies: Arc<dyn PolicyStore> = match &config.policy_base_url {
        Some(base) => Arc::new(HttpPolicyStore::new(fetcher.clone(), base.clone())),
        None => Arc::new(InMemoryPolicyStore::new()),
    };
    let portfolios: Arc<dyn PortfolioStore> = match &config.portfolio_base_url {
        Some(base) => Arc::new(HttpPortfolioStore::new(fetcher.clone(), base.clone())),
        None => Arc::new(InMemoryPortfolioStore::new()),
    };

    Ok(IngestionPipeline::new(
        lifecycle, uploads, resolver, directory, policies, portfolios,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pims_match::{NO_CUSTOMER_FOUND, VERIFICATION_FAILED};

    const MAPPING_YAML: &str = r#"
insurers:
  - insurer_id: HDFC_LIFE
    policy_types:
      - policy_type: TERM_LIFE
        field_mappings:
          - source_field: "Policy Num"
            target_field: policyNumber
            required: true
          - source_field: "Customer Name"
            target_field: customerName
          - source_field: "Mobile"
            target_field: mobileNumber
            transform: normalizeMobile
          - source_field: "DOB"
            target_field: dateOfBirth
            transform: normalizeDate
          - source_field: "Annual Premium"
            target_field: premiumAmount
            transform: normalizeCurrency
          - source_field: "Coverage"
            target_field: sumAssured
            transform: normalizeCurrency
          - source_field: "Status"
            target_field: status
            transform: normalizeStatus
"#;

    struct Fixture {
        pipeline: IngestionPipeline,
        directory: Arc<InMemoryCustomerDirectory>,
        policies: Arc<InMemoryPolicyStore>,
        portfolios: Arc<InMemoryPortfolioStore>,
        _uploads_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryCustomerDirectory::new());
        let policies = Arc::new(InMemoryPolicyStore::new());
        let portfolios = Arc::new(InMemoryPortfolioStore::new());
        let uploads_dir = tempfile::tempdir().expect("tempdir");
        let resolver = Arc::new(MappingResolver::new(
            StaticMappingConfig::from_yaml(MAPPING_YAML).unwrap(),
        ));
        let pipeline = IngestionPipeline::new(
            JobLifecycle::new(Arc::new(InMemoryJobStore::new())),
            UploadStore::new(uploads_dir.path()),
            resolver,
            directory.clone(),
            policies.clone(),
            portfolios.clone(),
        );
        Fixture {
            pipeline,
            directory,
            policies,
            portfolios,
            _uploads_dir: uploads_dir,
        }
    }

    fn seeded_customer() -> Customer {
        Customer {
            customer_id: "CUST-1".into(),
            first_name: "Subham".into(),
            last_name: "Dutta".into(),
            email: Some("s.dutta@example.com".into()),
            mobile_number: Some("919876543210".into()),
            pan_number: Some("ABCDE1234F".into()),
            date_of_birth: Some("1990-01-15".into()),
        }
    }

    const HAPPY_CSV: &str = "\
Policy Num,Customer Name,Mobile,DOB,Annual Premium,Coverage,Status
POL-1,Subam Dutta,9876543210,15/01/1990,\"₹12,000\",\"2,500,000\",A
POL-2,Rahul Sharma,9876543210,,5000,100000,ACTIVE
POL-3,Nobody Known,9999999999,,5000,100000,ACTIVE
";

    #[tokio::test]
    async fn mixed_file_completes_with_failures_recorded() {
        let fixture = fixture();
        fixture.directory.insert(seeded_customer());

        let job_id = fixture
            .pipeline
            .upload_and_create_job(
                "hdfc_jan.csv",
                HAPPY_CSV.as_bytes(),
                "HDFC_LIFE",
                "ops@pims",
                None,
            )
            .await
            .unwrap();

        let summary = fixture
            .pipeline
            .trigger_processing(&job_id, None)
            .await
            .unwrap();

        assert_eq!(summary.status, IngestionStatus::Completed);
        assert_eq!(summary.policy_type.as_deref(), Some("TERM_LIFE"));
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.created_policies, 1);
        assert_eq!(summary.verification_failures, 2);

        let job = fixture.pipeline.get_job_status(&job_id).await.unwrap();
        assert_eq!(job.status, IngestionStatus::Completed);
        assert_eq!(job.total_records, 3);
        assert_eq!(job.processed_records, 1);
        assert_eq!(job.verification_failures.len(), 2);
        assert_eq!(job.verification_failures[0].policy_number, "POL-2");
        assert_eq!(job.verification_failures[0].reason, VERIFICATION_FAILED);
        assert_eq!(job.verification_failures[1].policy_number, "POL-3");
        assert_eq!(job.verification_failures[1].reason, NO_CUSTOMER_FOUND);

        let created = fixture.policies.created().await;
        assert_eq!(created.len(), 1);
        let (policy_id, policy) = &created[0];
        assert_eq!(policy.policy_number, "POL-1");
        assert_eq!(policy.customer_id, "CUST-1");
        assert_eq!(policy.premium_amount, "12000");
        assert_eq!(policy.sum_assured, "2500000");
        assert_eq!(policy.status, "ACTIVE");

        let snapshots = fixture.portfolios.snapshots_for("CUST-1").await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(&snapshots[0].policy_id, policy_id);
        assert_eq!(snapshots[0].policy_number, "POL-1");
    }

    #[tokio::test]
    async fn empty_data_file_still_completes() {
        let fixture = fixture();
        let job_id = fixture
            .pipeline
            .upload_and_create_job(
                "empty.csv",
                b"Policy Num,Customer Name,Mobile,DOB,Annual Premium,Coverage,Status\n",
                "HDFC_LIFE",
                "ops@pims",
                None,
            )
            .await
            .unwrap();
        let summary = fixture
            .pipeline
            .trigger_processing(&job_id, None)
            .await
            .unwrap();
        assert_eq!(summary.status, IngestionStatus::Completed);
        assert_eq!(summary.total_records, 0);
        let job = fixture.pipeline.get_job_status(&job_id).await.unwrap();
        assert_eq!(job.status, IngestionStatus::Completed);
        assert_eq!(job.total_records, 0);
    }

    #[tokio::test]
    async fn missing_mappings_fail_the_job_with_a_reason() {
        let fixture = fixture();
        let job_id = fixture
            .pipeline
            .upload_and_create_job(
                "unknown.csv",
                b"Some Header\nsome value\n",
                "UNKNOWN_INSURER",
                "ops@pims",
                None,
            )
            .await
            .unwrap();
        let summary = fixture
            .pipeline
            .trigger_processing(&job_id, None)
            .await
            .unwrap();
        assert_eq!(summary.status, IngestionStatus::Failed);
        assert!(summary.failure_reason.is_some());

        let job = fixture.pipeline.get_job_status(&job_id).await.unwrap();
        assert_eq!(job.status, IngestionStatus::Failed);
        assert!(job
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("UNKNOWN_INSURER"));
    }

    #[tokio::test]
    async fn upload_validation_rejects_bad_inputs_before_any_job_exists() {
        let fixture = fixture();
        let err = fixture
            .pipeline
            .upload_and_create_job("policies.txt", b"data", "HDFC_LIFE", "ops@pims", None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidExtension { .. }));

        let err = fixture
            .pipeline
            .upload_and_create_job("policies.csv", b"", "HDFC_LIFE", "ops@pims", None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::EmptyFile));

        let err = fixture
            .pipeline
            .upload_and_create_job("", b"data", "HDFC_LIFE", "ops@pims", None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::MissingFilename));
    }

    #[tokio::test]
    async fn schema_validation_requires_mandatory_columns_for_normal_files() {
        let fixture = fixture();
        let err = fixture
            .pipeline
            .upload_and_create_job(
                "no_policy_num.csv",
                b"Customer Name,Mobile\nSubham Dutta,9876543210\n",
                "HDFC_LIFE",
                "ops@pims",
                None,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(&err, UploadError::MissingRequiredColumns(cols) if cols.contains("Policy Num"))
        );

        // Correction files skip the schema check.
        let job_id = fixture
            .pipeline
            .upload_and_create_job(
                "fixes_correction.csv",
                b"Customer Name,Mobile\nSubham Dutta,9876543210\n",
                "HDFC_LIFE",
                "ops@pims",
                Some("correction"),
            )
            .await
            .unwrap();
        let job = fixture.pipeline.get_job_status(&job_id).await.unwrap();
        assert_eq!(job.file_kind, FileKind::Correction);
    }

    #[tokio::test]
    async fn completed_jobs_cannot_be_reprocessed() {
        let fixture = fixture();
        let job_id = fixture
            .pipeline
            .upload_and_create_job(
                "empty.csv",
                b"Policy Num,Customer Name,Mobile,DOB,Annual Premium,Coverage,Status\n",
                "HDFC_LIFE",
                "ops@pims",
                None,
            )
            .await
            .unwrap();
        fixture.pipeline.trigger_processing(&job_id, None).await.unwrap();
        let err = fixture
            .pipeline
            .trigger_processing(&job_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn policy_type_hint_selects_the_mapping_set() {
        let yaml = r#"
insurers:
  - insurer_id: MULTI
    policy_types:
      - policy_type: HEALTH
        field_mappings:
          - source_field: "H Policy"
            target_field: policyNumber
      - policy_type: MOTOR
        field_mappings:
          - source_field: "M Policy"
            target_field: policyNumber
"#;
        let directory = Arc::new(InMemoryCustomerDirectory::new());
        directory.insert(Customer {
            customer_id: "CUST-9".into(),
            first_name: String::new(),
            last_name: String::new(),
            email: None,
            mobile_number: Some("919876543210".into()),
            pan_number: None,
            date_of_birth: None,
        });
        let uploads_dir = tempfile::tempdir().expect("tempdir");
        let pipeline = IngestionPipeline::new(
            JobLifecycle::new(Arc::new(InMemoryJobStore::new())),
            UploadStore::new(uploads_dir.path()),
            Arc::new(MappingResolver::new(
                StaticMappingConfig::from_yaml(yaml).unwrap(),
            )),
            directory,
            Arc::new(InMemoryPolicyStore::new()),
            Arc::new(InMemoryPortfolioStore::new()),
        );

        let job_id = pipeline
            .upload_and_create_job(
                "motor.csv",
                b"M Policy\nMOT-1\n",
                "MULTI",
                "ops@pims",
                None,
            )
            .await
            .unwrap();
        let summary = pipeline.trigger_processing(&job_id, Some("MOTOR")).await.unwrap();
        assert_eq!(summary.policy_type.as_deref(), Some("MOTOR"));
        assert_eq!(summary.total_records, 1);
    }
}
