//! Customer identity resolution over noisy insurer records.
//!
//! Given one canonical record, searches the customer directory by strong
//! identifiers in strict priority order (mobile, then PAN, then email) and
//! verifies each candidate with the secondary signals the record carries
//! (name similarity, date of birth). Never creates customers; a pure
//! resolver over the directory collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use pims_core::{CanonicalRecord, Customer, MatchResult};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "pims-match";

/// Max Levenshtein edit distance for two names to count as the same person.
pub const NAME_SIMILARITY_THRESHOLD: usize = 3;

pub const NO_CUSTOMER_FOUND: &str = "No customer found (mobile/email/PAN)";
pub const VERIFICATION_FAILED: &str = "Verification failed: name or DOB mismatch";

#[derive(Debug, Error)]
#[error("customer directory unavailable: {0}")]
pub struct DirectoryError(#[from] pub anyhow::Error);

/// Read-only lookup into the customer master. Single-candidate semantics:
/// each identifier resolves to at most one customer.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn search_by_mobile(&self, mobile: &str) -> Result<Option<Customer>, DirectoryError>;
    async fn search_by_email(&self, email: &str) -> Result<Option<Customer>, DirectoryError>;
    async fn search_by_pan(&self, pan: &str) -> Result<Option<Customer>, DirectoryError>;
}

/// Secondary verification of a candidate found via a single identifier.
/// Only a present-and-mismatched field fails; absence of either comparison
/// field on either side is not a failure.
pub fn verify_identity(candidate: &Customer, name: Option<&str>, dob: Option<&str>) -> bool {
    if let Some(name) = name {
        let candidate_name = candidate.full_name();
        if !candidate_name.is_empty() {
            let distance = strsim::levenshtein(
                &name.trim().to_lowercase(),
                &candidate_name.to_lowercase(),
            );
            debug!(record_name = name, candidate_name = candidate_name.as_str(), distance, "name similarity");
            if distance > NAME_SIMILARITY_THRESHOLD {
                return false;
            }
        }
    }
    if let (Some(dob), Some(candidate_dob)) = (dob, candidate.date_of_birth.as_deref()) {
        let record_digits = digits_of(dob);
        let candidate_digits = digits_of(candidate_dob);
        // Mutual-substring check tolerates truncated or partial date forms.
        if !record_digits.is_empty()
            && !candidate_digits.is_empty()
            && !record_digits.contains(&candidate_digits)
            && !candidate_digits.contains(&record_digits)
        {
            return false;
        }
    }
    true
}

fn digits_of(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

pub struct MatchEngine {
    directory: Arc<dyn CustomerDirectory>,
}

impl MatchEngine {
    pub fn new(directory: Arc<dyn CustomerDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve one canonical record to a customer identity.
    ///
    /// Directory failures propagate to the caller, which treats them as
    /// that record's failure rather than aborting the job.
    pub async fn resolve(&self, record: &CanonicalRecord) -> Result<MatchResult, DirectoryError> {
        let name = record.full_name();
        let name = name.as_deref();
        let dob = present(record.date_of_birth.as_ref());

        let mut candidates: Vec<(&'static str, Customer)> = Vec::new();

        if let Some(mobile) = present(record.mobile_number.as_ref()) {
            if let Some(customer) = self.directory.search_by_mobile(mobile).await? {
                if verify_identity(&customer, name, dob) {
                    debug!(customer_id = customer.customer_id.as_str(), "matched by mobile");
                    return Ok(MatchResult::Matched {
                        customer_id: customer.customer_id,
                    });
                }
                candidates.push(("mobile", customer));
            }
        }

        if let Some(pan) = present(record.pan_number.as_ref()) {
            if let Some(customer) = self.directory.search_by_pan(pan).await? {
                if verify_identity(&customer, name, dob) {
                    debug!(customer_id = customer.customer_id.as_str(), "matched by PAN");
                    return Ok(MatchResult::Matched {
                        customer_id: customer.customer_id,
                    });
                }
                candidates.push(("pan", customer));
            }
        }

        if let Some(email) = present(record.email.as_ref()) {
            if let Some(customer) = self.directory.search_by_email(email).await? {
                if verify_identity(&customer, name, dob) {
                    debug!(customer_id = customer.customer_id.as_str(), "matched by email");
                    return Ok(MatchResult::Matched {
                        customer_id: customer.customer_id,
                    });
                }
                candidates.push(("email", customer));
            }
        }

        if name.is_some() || dob.is_some() {
            // Partial-data corrections: give every collected candidate one
            // more verification pass against whatever signals exist.
            for (identifier, candidate) in &candidates {
                if verify_identity(candidate, name, dob) {
                    debug!(
                        customer_id = candidate.customer_id.as_str(),
                        identifier, "matched on re-verification"
                    );
                    return Ok(MatchResult::Matched {
                        customer_id: candidate.customer_id.clone(),
                    });
                }
            }
        } else if let Some((identifier, candidate)) = candidates.first() {
            // No secondary signal to verify with; take the strongest
            // identifier hit and flag it in the logs.
            warn!(
                customer_id = candidate.customer_id.as_str(),
                identifier,
                policy_number = record.policy_number.as_deref().unwrap_or("?"),
                "accepting unverified candidate: record carries no name or DOB"
            );
            return Ok(MatchResult::Matched {
                customer_id: candidate.customer_id.clone(),
            });
        }

        if candidates.is_empty() {
            Ok(MatchResult::Unmatched {
                reason: NO_CUSTOMER_FOUND.to_string(),
            })
        } else {
            Ok(MatchResult::Unmatched {
                reason: VERIFICATION_FAILED.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StubDirectory {
        by_mobile: HashMap<String, Customer>,
        by_pan: HashMap<String, Customer>,
        by_email: HashMap<String, Customer>,
        failing: bool,
    }

    #[async_trait]
    impl CustomerDirectory for StubDirectory {
        async fn search_by_mobile(&self, mobile: &str) -> Result<Option<Customer>, DirectoryError> {
            if self.failing {
                return Err(DirectoryError(anyhow::anyhow!("timed out")));
            }
            Ok(self.by_mobile.get(mobile).cloned())
        }

        async fn search_by_email(&self, email: &str) -> Result<Option<Customer>, DirectoryError> {
            if self.failing {
                return Err(DirectoryError(anyhow::anyhow!("timed out")));
            }
            Ok(self.by_email.get(email).cloned())
        }

        async fn search_by_pan(&self, pan: &str) -> Result<Option<Customer>, DirectoryError> {
            if self.failing {
                return Err(DirectoryError(anyhow::anyhow!("timed out")));
            }
            Ok(self.by_pan.get(pan).cloned())
        }
    }

    fn customer(id: &str, first: &str, last: &str, dob: Option<&str>) -> Customer {
        Customer {
            customer_id: id.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: None,
            mobile_number: None,
            pan_number: None,
            date_of_birth: dob.map(ToString::to_string),
        }
    }

    fn record(
        mobile: Option<&str>,
        pan: Option<&str>,
        email: Option<&str>,
        name: Option<&str>,
        dob: Option<&str>,
    ) -> CanonicalRecord {
        let mut record = CanonicalRecord::new("HDFC_LIFE", "TERM_LIFE");
        record.policy_number = Some("POL-1".into());
        record.mobile_number = mobile.map(ToString::to_string);
        record.pan_number = pan.map(ToString::to_string);
        record.email = email.map(ToString::to_string);
        record.customer_name = name.map(ToString::to_string);
        record.date_of_birth = dob.map(ToString::to_string);
        record
    }

    fn engine(directory: StubDirectory) -> MatchEngine {
        MatchEngine::new(Arc::new(directory))
    }

    #[test]
    fn small_typos_pass_name_verification() {
        let candidate = customer("C1", "Subham", "Dutta", None);
        assert!(verify_identity(&candidate, Some("Subam Dutta"), None));
        assert!(!verify_identity(&candidate, Some("Rahul"), None));
    }

    #[test]
    fn dob_comparison_tolerates_partial_representations() {
        let candidate = customer("C1", "Subham", "Dutta", Some("1990-01-15"));
        assert!(verify_identity(&candidate, None, Some("19900115")));
        assert!(verify_identity(&candidate, None, Some("1990-01-15T00:00:00")));
        assert!(!verify_identity(&candidate, None, Some("1991-02-20")));
    }

    #[test]
    fn absent_fields_never_fail_verification() {
        let nameless = Customer {
            first_name: String::new(),
            last_name: String::new(),
            ..customer("C1", "", "", None)
        };
        assert!(verify_identity(&nameless, Some("Anyone At All"), None));
        let candidate = customer("C2", "Subham", "Dutta", None);
        assert!(verify_identity(&candidate, None, Some("19900115")));
    }

    #[tokio::test]
    async fn verified_mobile_match_resolves() {
        let mut directory = StubDirectory::default();
        directory
            .by_mobile
            .insert("919876543210".into(), customer("C1", "Subham", "Dutta", None));
        let result = engine(directory)
            .resolve(&record(
                Some("919876543210"),
                None,
                None,
                Some("Subam Dutta"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(result, MatchResult::Matched { customer_id: "C1".into() });
    }

    #[tokio::test]
    async fn mobile_wins_over_pan_when_both_verify() {
        let mut directory = StubDirectory::default();
        directory
            .by_mobile
            .insert("919876543210".into(), customer("C1", "Subham", "Dutta", None));
        directory
            .by_pan
            .insert("ABCDE1234F".into(), customer("C2", "Subham", "Dutta", None));
        let result = engine(directory)
            .resolve(&record(
                Some("919876543210"),
                Some("ABCDE1234F"),
                None,
                Some("Subham Dutta"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(result, MatchResult::Matched { customer_id: "C1".into() });
    }

    #[tokio::test]
    async fn fallthrough_to_pan_when_mobile_candidate_fails_verification() {
        let mut directory = StubDirectory::default();
        directory
            .by_mobile
            .insert("919876543210".into(), customer("C1", "Totally", "Different", None));
        directory
            .by_pan
            .insert("ABCDE1234F".into(), customer("C2", "Subham", "Dutta", None));
        let result = engine(directory)
            .resolve(&record(
                Some("919876543210"),
                Some("ABCDE1234F"),
                None,
                Some("Subham Dutta"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(result, MatchResult::Matched { customer_id: "C2".into() });
    }

    #[tokio::test]
    async fn unverifiable_candidate_is_reported_not_accepted() {
        let mut directory = StubDirectory::default();
        directory
            .by_mobile
            .insert("919876543210".into(), customer("C1", "Totally", "Different", None));
        let result = engine(directory)
            .resolve(&record(
                Some("919876543210"),
                None,
                None,
                Some("Subham Dutta"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(
            result,
            MatchResult::Unmatched {
                reason: VERIFICATION_FAILED.to_string()
            }
        );
    }

    #[tokio::test]
    async fn candidate_without_secondary_signals_is_accepted_unverified() {
        let mut directory = StubDirectory::default();
        directory
            .by_email
            .insert("s.dutta@example.com".into(), customer("C3", "Subham", "Dutta", None));
        let result = engine(directory)
            .resolve(&record(None, None, Some("s.dutta@example.com"), None, None))
            .await
            .unwrap();
        assert_eq!(result, MatchResult::Matched { customer_id: "C3".into() });
    }

    #[tokio::test]
    async fn no_candidate_anywhere_reports_no_customer_found() {
        let result = engine(StubDirectory::default())
            .resolve(&record(
                Some("919876543210"),
                Some("ABCDE1234F"),
                Some("s.dutta@example.com"),
                Some("Subham Dutta"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(
            result,
            MatchResult::Unmatched {
                reason: NO_CUSTOMER_FOUND.to_string()
            }
        );
    }

    #[tokio::test]
    async fn dob_only_records_verify_against_candidates() {
        let mut directory = StubDirectory::default();
        directory
            .by_pan
            .insert("ABCDE1234F".into(), customer("C2", "Subham", "Dutta", Some("1990-01-15")));
        let result = engine(directory)
            .resolve(&record(None, Some("ABCDE1234F"), None, None, Some("19900115")))
            .await
            .unwrap();
        assert_eq!(result, MatchResult::Matched { customer_id: "C2".into() });
    }

    #[tokio::test]
    async fn directory_failures_propagate_to_the_caller() {
        let directory = StubDirectory {
            failing: true,
            ..StubDirectory::default()
        };
        let err = engine(directory)
            .resolve(&record(Some("919876543210"), None, None, None, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
