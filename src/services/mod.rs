//! Platform adapters and the plumbing they share.
//!
//! Each submodule speaks one code-review platform's API and reduces its
//! payloads to [`Review`] records. The aggregator drives them through the
//! [`ReviewSource`] trait, one target at a time.

pub mod gerrit;
pub mod github;
pub mod gitlab;
pub mod pagure;
pub mod phabricator;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::HarvestError;
use crate::review::age::Age;
use crate::review::duration::has_new_comments;
use crate::review::{LastComment, Review};

/// Gerrit and friends prefix JSON bodies with this guard against XSSI.
const XSSI_GUARD: &str = ")]}'\n";

/// Per-run parameters shared by every platform adapter.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext {
    /// Age filter, when one was configured.
    pub age: Option<Age>,
    /// Freshness window in days for comment-based suppression, when the
    /// last-comment option is active.
    pub show_last_comment: Option<u32>,
    /// Reference instant shared by the whole run.
    pub now: DateTime<Utc>,
}

impl FetchContext {
    /// Apply the age filter and comment-freshness suppression to one review.
    ///
    /// A review passes when its creation time satisfies the age filter and,
    /// with a freshness window active, its latest comment is not newer than
    /// the window.
    #[must_use]
    pub fn accepts(&self, created: DateTime<Utc>, last_comment: Option<&LastComment>) -> bool {
        if let Some(age) = self.age {
            if !age.allows(created) {
                return false;
            }
        }
        if let (Some(comment), Some(days)) = (last_comment, self.show_last_comment) {
            if has_new_comments(comment.created_at, days, self.now) {
                return false;
            }
        }
        true
    }
}

/// One harvest unit: a platform service bound to a single configured target.
///
/// The aggregator fetches targets sequentially and decides per target
/// whether a failure aborts the run or only skips the target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewSource: Send + Sync {
    /// Label naming the target in skip warnings.
    fn label(&self) -> String;

    /// Fetch the open reviews for this target.
    async fn fetch(&self, context: &FetchContext) -> Result<Vec<Review>, HarvestError>;
}

/// TLS verification policy for the harvesting HTTP clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Verify certificates against the system roots.
    #[default]
    Verify,
    /// Accept any certificate.
    Insecure,
    /// Verify against a CA bundle read from this path.
    CaBundle(std::path::PathBuf),
}

impl TlsPolicy {
    /// Build a reqwest client honouring this policy.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Configuration`] when the CA bundle cannot be
    /// read, and [`HarvestError::Network`] when the client cannot be built.
    pub fn build_client(&self) -> Result<reqwest::Client, HarvestError> {
        let mut builder = reqwest::Client::builder();
        match self {
            Self::Verify => {}
            Self::Insecure => {
                builder = builder.danger_accept_invalid_certs(true);
            }
            Self::CaBundle(path) => {
                for certificate in read_ca_bundle(path)? {
                    builder = builder.add_root_certificate(certificate);
                }
            }
        }
        builder.build().map_err(|error| HarvestError::Network {
            message: format!("cannot build HTTP client: {error}"),
        })
    }
}

/// Read and parse every certificate in a PEM bundle.
fn read_ca_bundle(path: &Path) -> Result<Vec<reqwest::Certificate>, HarvestError> {
    let pem = std::fs::read(path).map_err(|error| HarvestError::Configuration {
        message: format!("cannot read CA certificate file {}: {error}", path.display()),
    })?;
    reqwest::Certificate::from_pem_bundle(&pem).map_err(|error| HarvestError::Configuration {
        message: format!("cannot parse CA certificate file {}: {error}", path.display()),
    })
}

/// Classify a reqwest send failure.
pub(crate) fn transport_error(context: &str, error: &reqwest::Error) -> HarvestError {
    if error.is_decode() {
        HarvestError::Decode {
            message: format!("{context}: {error}"),
        }
    } else {
        HarvestError::Network {
            message: format!("{context}: {error}"),
        }
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn status_error(context: &str, status: StatusCode) -> HarvestError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        HarvestError::AuthFailed {
            message: format!("{context}: HTTP {status}"),
        }
    } else {
        HarvestError::Network {
            message: format!("{context}: HTTP {status}"),
        }
    }
}

/// Surface a non-success response as the mapped error.
pub(crate) fn expect_success(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, HarvestError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(context, status))
    }
}

/// Read a response body as JSON, mapping failures onto the taxonomy.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> Result<T, HarvestError> {
    response
        .json()
        .await
        .map_err(|error| transport_error(context, &error))
}

/// Decode a JSON body, tolerating the XSSI guard prefix some platforms
/// write before the payload.
pub(crate) fn decode_guarded_json<T: DeserializeOwned>(
    body: &str,
    context: &str,
) -> Result<T, HarvestError> {
    let trimmed = body.trim();
    let payload = trimmed.strip_prefix(XSSI_GUARD).unwrap_or(trimmed);
    serde_json::from_str(payload).map_err(|error| HarvestError::Decode {
        message: format!("{context}: {error}"),
    })
}

/// Parse an epoch-seconds string, as Pagure and Phabricator send dates.
pub(crate) fn parse_epoch_seconds(raw: &str, context: &str) -> Result<DateTime<Utc>, HarvestError> {
    let seconds = raw.trim().parse::<i64>().map_err(|error| HarvestError::Decode {
        message: format!("{context}: cannot parse epoch '{raw}': {error}"),
    })?;
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| HarvestError::Decode {
        message: format!("{context}: epoch '{raw}' is out of range"),
    })
}

/// Parse a platform timestamp in the given chrono format as UTC.
pub(crate) fn parse_platform_timestamp(
    raw: &str,
    format: &str,
    context: &str,
) -> Result<DateTime<Utc>, HarvestError> {
    chrono::NaiveDateTime::parse_from_str(raw, format)
        .map(|naive| naive.and_utc())
        .map_err(|error| HarvestError::Decode {
            message: format!("{context}: cannot parse timestamp '{raw}': {error}"),
        })
}

/// Gravatar URL for an email address, 64 pixels with the retro fallback.
pub(crate) fn gravatar_url(email: &str) -> String {
    let digest = Md5::digest(email.trim().to_lowercase().as_bytes());
    format!(
        "https://www.gravatar.com/avatar/{}?s=64&d=retro",
        hex::encode(digest)
    )
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Tests panic on failure")]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::review::age::Age;
    use crate::review::testing;

    fn context_at(now: DateTime<Utc>) -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now,
        }
    }

    #[rstest]
    fn accepts_everything_without_filters() {
        let now = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        let review = testing::review("anything");
        assert!(context_at(now).accepts(review.time, review.last_comment.as_ref()));
    }

    #[rstest]
    fn age_filter_rejects_reviews_outside_the_cutoff() {
        let now = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        let tokens = vec![String::from("newer"), String::from("30d")];
        let mut context = context_at(now);
        context.age = Some(Age::parse(&tokens, now).unwrap());
        let recent = now - chrono::Duration::days(10);
        let stale = now - chrono::Duration::days(40);
        assert!(context.accepts(recent, None));
        assert!(!context.accepts(stale, None));
    }

    #[rstest]
    fn freshness_window_suppresses_recently_commented_reviews() {
        let now = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        let mut context = context_at(now);
        context.show_last_comment = Some(7);
        let mut review = testing::with_last_comment(testing::review("quiet"), "alice", "ping");
        if let Some(comment) = review.last_comment.as_mut() {
            comment.created_at = now - chrono::Duration::days(2);
        }
        assert!(!context.accepts(review.time, review.last_comment.as_ref()));

        if let Some(comment) = review.last_comment.as_mut() {
            comment.created_at = now - chrono::Duration::days(30);
        }
        assert!(context.accepts(review.time, review.last_comment.as_ref()));
    }

    #[rstest]
    #[case::plain_json("{\"ok\": true}")]
    #[case::guarded_json(")]}'\n{\"ok\": true}")]
    #[case::guarded_with_padding("  )]}'\n{\"ok\": true}\n")]
    fn decodes_guarded_json(#[case] body: &str) {
        let value: serde_json::Value = decode_guarded_json(body, "gerrit changes").unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
    }

    #[rstest]
    fn rejects_unparseable_guarded_json() {
        let error = decode_guarded_json::<serde_json::Value>(")]}'\nnot json", "gerrit changes")
            .unwrap_err();
        assert!(matches!(error, HarvestError::Decode { .. }));
    }

    #[rstest]
    fn parses_epoch_second_strings() {
        let parsed = parse_epoch_seconds("1514764800", "pagure").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap());
    }

    #[rstest]
    fn rejects_non_numeric_epochs() {
        let error = parse_epoch_seconds("yesterday", "pagure").unwrap_err();
        assert!(matches!(error, HarvestError::Decode { .. }));
    }

    #[rstest]
    fn gravatar_url_hashes_the_normalized_address() {
        // md5 of "jdoe@example.com"
        assert_eq!(
            gravatar_url("  JDoe@Example.com "),
            "https://www.gravatar.com/avatar/694ea0904ceaf766c6738166ed89bafb?s=64&d=retro"
        );
    }
}
