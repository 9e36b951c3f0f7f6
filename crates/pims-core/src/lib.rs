//! Core domain model and value normalization for PIMS.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pims-core";

/// Lifecycle states of an ingestion job.
///
/// Transitions only ever move forward: `Uploaded -> Processing ->
/// {Completed, Failed}`. The two terminal states admit nothing further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl IngestionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn allows_transition_to(self, next: IngestionStatus) -> bool {
        match self {
            Self::Uploaded => next == Self::Processing,
            Self::Processing => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uploaded => "UPLOADED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Whether an upload carries fresh data or corrections to earlier rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Normal,
    Correction,
}

impl FileKind {
    /// Resolve the kind from an explicit caller hint, falling back to the
    /// `_correction` filename convention used by several insurers.
    pub fn resolve(hint: Option<&str>, filename: &str) -> Self {
        if let Some(hint) = hint {
            if hint.trim().eq_ignore_ascii_case("correction") {
                return Self::Correction;
            }
        }
        if filename.to_ascii_lowercase().contains("_correction") {
            return Self::Correction;
        }
        Self::Normal
    }
}

/// One record that could not be stitched to a customer, kept on the job for
/// operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFailure {
    pub policy_number: String,
    pub reason: String,
}

/// Tracks one uploaded file through its processing lifecycle. Never deleted
/// by the pipeline; retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub insurer_id: String,
    pub file_path: String,
    pub file_kind: FileKind,
    pub status: IngestionStatus,
    pub total_records: u32,
    pub processed_records: u32,
    pub uploaded_by: String,
    pub failure_reason: Option<String>,
    pub verification_failures: Vec<VerificationFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Advisory data type carried on a field mapping. Downstream validation may
/// consult it; the mapper itself never enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Decimal,
    Integer,
    Date,
    Boolean,
}

impl Default for FieldType {
    fn default() -> Self {
        Self::String
    }
}

/// One declarative rule translating a source column into a canonical field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub data_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: Option<String>,
}

/// A single normalized cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl FieldValue {
    /// Render as the string form transforms and verification operate on.
    /// Integral numbers print without a trailing `.0`, matching how
    /// spreadsheet cells are coerced.
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Canonical per-row record produced by the mapper. Known fields are typed;
/// insurer-specific extras land in the `extra` bag keyed by canonical name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub insurer_id: String,
    pub policy_type: String,
    pub policy_number: Option<String>,
    pub customer_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub mobile_number: Option<String>,
    pub email: Option<String>,
    pub pan_number: Option<String>,
    pub date_of_birth: Option<String>,
    pub premium_amount: Option<String>,
    pub sum_assured: Option<String>,
    pub policy_status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub plan_name: Option<String>,
    pub city: Option<String>,
    pub extra: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn new(insurer_id: impl Into<String>, policy_type: impl Into<String>) -> Self {
        Self {
            insurer_id: insurer_id.into(),
            policy_type: policy_type.into(),
            ..Self::default()
        }
    }

    /// Store a mapped value under its canonical field name. Unknown names go
    /// into the extras bag rather than being dropped.
    pub fn set_field(&mut self, target_field: &str, value: FieldValue) {
        let slot = match target_field {
            "policyNumber" => &mut self.policy_number,
            "customerName" => &mut self.customer_name,
            "firstName" => &mut self.first_name,
            "lastName" => &mut self.last_name,
            "mobileNumber" => &mut self.mobile_number,
            "email" => &mut self.email,
            "panNumber" => &mut self.pan_number,
            "dateOfBirth" => &mut self.date_of_birth,
            "premiumAmount" => &mut self.premium_amount,
            "sumAssured" => &mut self.sum_assured,
            "status" => &mut self.policy_status,
            "startDate" => &mut self.start_date,
            "endDate" => &mut self.end_date,
            "planName" => &mut self.plan_name,
            "city" => &mut self.city,
            _ => {
                self.extra.insert(target_field.to_string(), value);
                return;
            }
        };
        *slot = Some(value.render());
    }

    /// The name used for identity verification: `customerName` when mapped,
    /// otherwise split first/last columns joined.
    pub fn full_name(&self) -> Option<String> {
        if let Some(name) = &self.customer_name {
            if !name.trim().is_empty() {
                return Some(name.trim().to_string());
            }
        }
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first.trim(), last.trim())),
            (Some(first), None) => Some(first.trim().to_string()),
            (None, Some(last)) => Some(last.trim().to_string()),
            (None, None) => None,
        }
    }
}

/// Master customer record as returned by the customer directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub mobile_number: Option<String>,
    #[serde(default)]
    pub pan_number: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
}

impl Customer {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

/// Outcome of resolving one canonical record against the customer master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    Matched { customer_id: String },
    Unmatched { reason: String },
}

/// Policy payload handed to the policy store after a successful match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyData {
    pub policy_number: String,
    pub customer_id: String,
    pub insurer_id: String,
    pub policy_type: String,
    #[serde(default)]
    pub plan_name: Option<String>,
    pub premium_amount: String,
    pub sum_assured: String,
    pub status: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// Identifier assigned by the policy store on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPolicy {
    pub policy_id: String,
}

/// Denormalized per-policy entry appended to a customer's portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy_id: String,
    pub policy_number: String,
    pub insurer_id: String,
    pub policy_type: String,
    #[serde(default)]
    pub plan_name: Option<String>,
    pub premium_amount: String,
    pub sum_assured: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    pub status: String,
}

pub mod normalize {
    //! Stateless massaging transforms applied by name during mapping.
    //!
    //! Every function takes and returns strings; unparsable input passes
    //! through unchanged so downstream validation can flag it instead of a
    //! transform aborting the row.

    use super::NaiveDate;

    /// Accepts `yyyyMMdd`, `yyyy-MM-dd`, `dd-MM-yyyy`, `dd/MM/yyyy`;
    /// always emits `yyyy-MM-dd`.
    pub fn normalize_date(value: &str) -> String {
        let compact: String = value
            .trim()
            .replace('/', "-")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if compact.len() == 8 && compact.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(d) = NaiveDate::parse_from_str(&compact, "%Y%m%d") {
                return d.format("%Y-%m-%d").to_string();
            }
            return value.to_string();
        }
        for fmt in ["%Y-%m-%d", "%d-%m-%Y"] {
            if let Ok(d) = NaiveDate::parse_from_str(&compact, fmt) {
                return d.format("%Y-%m-%d").to_string();
            }
        }
        value.to_string()
    }

    /// Strips currency symbols and thousand separators; empty or unparsable
    /// amounts become `"0"`.
    pub fn normalize_currency(value: &str) -> String {
        let stripped: String = value
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        if stripped.is_empty() || stripped.parse::<f64>().is_err() {
            return "0".to_string();
        }
        stripped
    }

    /// Digits only, with Indian country-code handling: a bare 10-digit
    /// number gains a `91` prefix, an 11-digit number with a leading trunk
    /// `0` has it replaced by `91`. Other lengths pass through.
    pub fn normalize_mobile(value: &str) -> String {
        let digits: String = value.chars().filter(char::is_ascii_digit).collect();
        if digits.len() == 10 {
            return format!("91{digits}");
        }
        if digits.len() == 11 && digits.starts_with('0') {
            return format!("91{}", &digits[1..]);
        }
        digits
    }

    /// Maps insurer status vocabularies onto {ACTIVE, LAPSED, CANCELLED,
    /// PENDING}; anything unrecognized is upper-cased and passed through.
    pub fn normalize_status(value: &str) -> String {
        let s = value.trim().to_ascii_uppercase();
        match s.as_str() {
            "ACTIVE" | "A" | "1" | "Y" | "YES" | "CURRENT" => "ACTIVE".to_string(),
            "LAPSED" | "LAPSE" | "L" => "LAPSED".to_string(),
            "CANCELLED" | "CANCEL" | "C" | "INACTIVE" | "N" => "CANCELLED".to_string(),
            "PENDING" | "P" => "PENDING".to_string(),
            _ => s,
        }
    }

    /// Transform dispatch by metadata name. Unknown names are a no-op, not
    /// an error: transform names are advisory configuration.
    pub fn apply_transform(name: &str, value: &str) -> String {
        match name {
            "normalizeDate" => normalize_date(value),
            "normalizeCurrency" => normalize_currency(value),
            "normalizeMobile" => normalize_mobile(value),
            "normalizeStatus" => normalize_status(value),
            _ => value.to_string(),
        }
    }
}
