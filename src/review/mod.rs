//! Normalized review records and the shared filtering helpers.
//!
//! Every platform adapter reduces its native pull, merge, or change
//! request payload to a [`Review`]. Filtering, sorting, and formatting
//! operate on that one shape, so none of them know which platform a
//! record came from beyond its [`ServiceKind`] tag.

pub mod age;
pub mod duration;
pub mod format;
pub mod wip;

use chrono::{DateTime, Utc};

/// Platform a review was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// GitHub pull requests.
    Github,
    /// GitLab merge requests.
    Gitlab,
    /// Pagure pull requests.
    Pagure,
    /// Gerrit changes.
    Gerrit,
    /// Phabricator differential revisions.
    Phabricator,
}

impl ServiceKind {
    /// Lowercase platform label used in JSON output and log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Pagure => "pagure",
            Self::Gerrit => "gerrit",
            Self::Phabricator => "phabricator",
        }
    }
}

/// Latest comment left on a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastComment {
    /// Who wrote the comment.
    pub author: String,
    /// Comment text.
    pub body: String,
    /// When the comment was written.
    pub created_at: DateTime<Utc>,
}

/// One open pull, merge, or change request in normalized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    /// Author login or display name.
    pub user: String,
    /// Title as the platform reports it.
    pub title: String,
    /// Browser URL of the review.
    pub url: String,
    /// When the review was filed.
    pub time: DateTime<Utc>,
    /// When the review last changed, never earlier than `time`.
    pub updated_time: DateTime<Utc>,
    /// Number of comments the platform reports.
    pub comments: usize,
    /// Avatar or platform logo URL.
    pub image: String,
    /// Latest comment, when the review has any.
    pub last_comment: Option<LastComment>,
    /// Repository or project the review belongs to.
    pub project_name: String,
    /// Browser URL of that repository or project.
    pub project_url: String,
    /// Platform the review came from.
    pub source: ServiceKind,
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Tests panic on failure")]
pub(crate) mod testing {
    use chrono::TimeZone;

    use super::{LastComment, Review, ServiceKind, Utc};

    /// Review fixture with fixed timestamps for filter and formatter tests.
    pub(crate) fn review(title: &str) -> Review {
        Review {
            user: String::from("dummy_user"),
            title: String::from(title),
            url: String::from("dummy_url"),
            time: Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            updated_time: Utc.with_ymd_and_hms(2017, 1, 2, 0, 0, 0).unwrap(),
            comments: 1,
            image: String::from("dummy_image"),
            last_comment: None,
            project_name: String::from("dummy_project"),
            project_url: String::from("dummy_project_url"),
            source: ServiceKind::Github,
        }
    }

    /// Attach a fixed last comment to a fixture review.
    pub(crate) fn with_last_comment(mut base: Review, author: &str, body: &str) -> Review {
        base.last_comment = Some(LastComment {
            author: String::from(author),
            body: String::from(body),
            created_at: Utc.with_ymd_and_hms(2017, 1, 2, 0, 0, 0).unwrap(),
        });
        base
    }
}
