//! Fans configured services out into harvest targets and runs them.
//!
//! Each configured repository becomes one [`ReviewSource`] target sharing
//! its platform client, so per-service caches such as the Gerrit host probe
//! carry across targets. Targets run sequentially; a failing target is
//! logged and skipped unless it failed to authenticate, which aborts the
//! whole run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Deserialize;

use crate::config::GitServiceConfig;
use crate::error::HarvestError;
use crate::review::Review;
use crate::services::gerrit::GerritService;
use crate::services::github::GithubService;
use crate::services::gitlab::GitlabService;
use crate::services::pagure::PagureService;
use crate::services::phabricator::PhabricatorService;
use crate::services::{FetchContext, ReviewSource, TlsPolicy};

/// Sort key for the final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    /// Creation time.
    #[default]
    Submitted,
    /// Last update time.
    Updated,
    /// Last comment time, never-commented reviews first.
    Commented,
}

/// One GitHub account or repository target.
struct GithubTarget {
    service: Arc<GithubService>,
    target: String,
}

#[async_trait]
impl ReviewSource for GithubTarget {
    fn label(&self) -> String {
        format!("github/{}", self.target)
    }

    async fn fetch(&self, context: &FetchContext) -> Result<Vec<Review>, HarvestError> {
        self.service.request_reviews(&self.target, context).await
    }
}

/// One GitLab group or project target.
struct GitlabTarget {
    service: Arc<GitlabService>,
    target: String,
}

#[async_trait]
impl ReviewSource for GitlabTarget {
    fn label(&self) -> String {
        format!("gitlab/{}", self.target)
    }

    async fn fetch(&self, context: &FetchContext) -> Result<Vec<Review>, HarvestError> {
        self.service.request_reviews(&self.target, context).await
    }
}

/// One Pagure repository target.
struct PagureTarget {
    service: Arc<PagureService>,
    target: String,
}

#[async_trait]
impl ReviewSource for PagureTarget {
    fn label(&self) -> String {
        format!("pagure/{}", self.target)
    }

    async fn fetch(&self, context: &FetchContext) -> Result<Vec<Review>, HarvestError> {
        self.service.request_reviews(&self.target, context).await
    }
}

/// One Gerrit project target.
struct GerritTarget {
    service: Arc<GerritService>,
    target: String,
}

#[async_trait]
impl ReviewSource for GerritTarget {
    fn label(&self) -> String {
        format!("gerrit/{}", self.target)
    }

    async fn fetch(&self, context: &FetchContext) -> Result<Vec<Review>, HarvestError> {
        self.service.request_reviews(&self.target, context).await
    }
}

/// One Phabricator instance with its responsible users.
struct PhabricatorTarget {
    service: PhabricatorService,
    user_names: Vec<String>,
    label: String,
}

#[async_trait]
impl ReviewSource for PhabricatorTarget {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn fetch(&self, context: &FetchContext) -> Result<Vec<Review>, HarvestError> {
        self.service.request_reviews(&self.user_names, context).await
    }
}

/// Expand every configured service into its harvest targets.
///
/// # Errors
///
/// Returns the platform constructor's error when a client cannot be built.
pub fn build_targets(
    services: &[GitServiceConfig],
    tls: &TlsPolicy,
) -> Result<Vec<Box<dyn ReviewSource>>, HarvestError> {
    let mut targets: Vec<Box<dyn ReviewSource>> = Vec::new();
    for service in services {
        match service {
            GitServiceConfig::Github { token, repos } => {
                let github = Arc::new(GithubService::new(token.as_deref())?);
                for repo in repos {
                    targets.push(Box::new(GithubTarget {
                        service: Arc::clone(&github),
                        target: repo.clone(),
                    }));
                }
            }
            GitServiceConfig::Gitlab { host, token, repos } => {
                let gitlab = Arc::new(GitlabService::new(host, token.as_deref(), tls)?);
                for repo in repos {
                    targets.push(Box::new(GitlabTarget {
                        service: Arc::clone(&gitlab),
                        target: repo.clone(),
                    }));
                }
            }
            GitServiceConfig::Pagure { repos } => {
                let pagure = Arc::new(PagureService::new(tls)?);
                for repo in repos {
                    targets.push(Box::new(PagureTarget {
                        service: Arc::clone(&pagure),
                        target: repo.clone(),
                    }));
                }
            }
            GitServiceConfig::Gerrit {
                host,
                repos,
                reviewers,
            } => {
                let gerrit = Arc::new(GerritService::new(host, reviewers.clone(), tls)?);
                for repo in repos {
                    targets.push(Box::new(GerritTarget {
                        service: Arc::clone(&gerrit),
                        target: repo.clone(),
                    }));
                }
            }
            GitServiceConfig::Phabricator {
                host,
                token,
                user_names,
            } => {
                targets.push(Box::new(PhabricatorTarget {
                    service: PhabricatorService::new(host, token, tls)?,
                    user_names: user_names.clone(),
                    label: format!("phabricator/{host}"),
                }));
            }
        }
    }
    Ok(targets)
}

/// Run every target in order and collect what they yield.
///
/// A target that cannot authenticate aborts the run. Any other failure is
/// logged and the target skipped, so one broken repository does not hide
/// the rest of the report.
///
/// # Errors
///
/// Returns [`HarvestError::AuthFailed`] as soon as a target reports it.
pub async fn harvest_all(
    targets: &[Box<dyn ReviewSource>],
    context: &FetchContext,
) -> Result<Vec<Review>, HarvestError> {
    let mut reviews = Vec::new();
    for target in targets {
        match target.fetch(context).await {
            Ok(mut batch) => reviews.append(&mut batch),
            Err(error @ HarvestError::AuthFailed { .. }) => return Err(error),
            Err(error) => {
                tracing::warn!(target = %target.label(), %error, "skipping target");
            }
        }
    }
    Ok(reviews)
}

/// Order reviews by the chosen key, oldest first unless reversed.
pub fn sort_reviews(reviews: &mut [Review], field: SortField, reverse: bool) {
    reviews.sort_by_key(|review| sort_key(review, field));
    if reverse {
        reviews.reverse();
    }
}

/// Sort key of one review, never-commented reviews ranking first under
/// [`SortField::Commented`].
fn sort_key(review: &Review, field: SortField) -> (u8, DateTime<Utc>) {
    match field {
        SortField::Submitted => (0, review.time),
        SortField::Updated => (0, review.updated_time),
        SortField::Commented => review
            .last_comment
            .as_ref()
            .map_or((0, review.time), |comment| (1, comment.created_at)),
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests panic on failure"
)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::services::MockReviewSource;
    use crate::services::gerrit::ReviewersConfig;
    use crate::review::testing;

    fn context() -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now: chrono::Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn source_yielding(title: &str) -> MockReviewSource {
        let review = testing::review(title);
        let mut source = MockReviewSource::new();
        source
            .expect_label()
            .return_const(String::from("mock/target"));
        source
            .expect_fetch()
            .returning(move |_| Ok(vec![review.clone()]));
        source
    }

    fn source_failing(error: HarvestError) -> MockReviewSource {
        let mut source = MockReviewSource::new();
        source
            .expect_label()
            .return_const(String::from("mock/broken"));
        source.expect_fetch().returning(move |_| Err(error.clone()));
        source
    }

    #[rstest]
    #[tokio::test]
    async fn build_targets_fans_out_per_repository() {
        let services = vec![
            GitServiceConfig::Github {
                token: None,
                repos: vec![String::from("kedark"), String::from("kedark/testing")],
            },
            GitServiceConfig::Gitlab {
                host: String::from("https://gitlab.example"),
                token: Some(String::from("sometoken")),
                repos: vec![String::from("dream-team")],
            },
            GitServiceConfig::Pagure {
                repos: vec![String::from("testrepo")],
            },
            GitServiceConfig::Gerrit {
                host: String::from("https://gerrit.example"),
                repos: vec![String::from("testproject")],
                reviewers: Some(ReviewersConfig::default()),
            },
            GitServiceConfig::Phabricator {
                host: String::from("https://phab.example/api/"),
                token: String::from("api-sometoken"),
                user_names: vec![String::from("jdoe")],
            },
        ];

        let targets = build_targets(&services, &TlsPolicy::Verify).expect("should build targets");
        let labels: Vec<String> = targets.iter().map(|target| target.label()).collect();
        assert_eq!(
            labels,
            vec![
                String::from("github/kedark"),
                String::from("github/kedark/testing"),
                String::from("gitlab/dream-team"),
                String::from("pagure/testrepo"),
                String::from("gerrit/testproject"),
                String::from("phabricator/https://phab.example/api/"),
            ]
        );
    }

    #[tokio::test]
    async fn harvest_skips_broken_targets() {
        let targets: Vec<Box<dyn ReviewSource>> = vec![
            Box::new(source_yielding("first")),
            Box::new(source_failing(HarvestError::NotFound {
                message: String::from("No repo found. Please check the repo name in config file."),
            })),
            Box::new(source_yielding("second")),
        ];

        let reviews = harvest_all(&targets, &context())
            .await
            .expect("harvest should tolerate the broken target");
        let titles: Vec<&str> = reviews.iter().map(|review| review.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn harvest_aborts_on_authentication_failure() {
        let mut untouched = MockReviewSource::new();
        untouched.expect_fetch().times(0);
        let targets: Vec<Box<dyn ReviewSource>> = vec![
            Box::new(source_yielding("first")),
            Box::new(source_failing(HarvestError::AuthFailed {
                message: String::from("fetch user: GitHub returned 401 Bad credentials"),
            })),
            Box::new(untouched),
        ];

        let error = harvest_all(&targets, &context())
            .await
            .expect_err("authentication failure should abort");
        assert!(matches!(error, HarvestError::AuthFailed { .. }));
    }

    fn dated_review(title: &str, day: u32) -> Review {
        let mut review = testing::review(title);
        review.time = chrono::Utc.with_ymd_and_hms(2017, 1, day, 0, 0, 0).unwrap();
        review.updated_time = chrono::Utc
            .with_ymd_and_hms(2017, 2, 28 - day, 0, 0, 0)
            .unwrap();
        review
    }

    #[rstest]
    fn sorts_by_submission_time() {
        let mut reviews = vec![
            dated_review("newest", 20),
            dated_review("oldest", 1),
            dated_review("middle", 10),
        ];
        sort_reviews(&mut reviews, SortField::Submitted, false);
        let titles: Vec<&str> = reviews.iter().map(|review| review.title.as_str()).collect();
        assert_eq!(titles, vec!["oldest", "middle", "newest"]);

        sort_reviews(&mut reviews, SortField::Submitted, true);
        let reversed: Vec<&str> = reviews.iter().map(|review| review.title.as_str()).collect();
        assert_eq!(reversed, vec!["newest", "middle", "oldest"]);
    }

    #[rstest]
    fn sorts_by_update_time() {
        let mut reviews = vec![
            dated_review("updated-late", 1),
            dated_review("updated-early", 20),
        ];
        sort_reviews(&mut reviews, SortField::Updated, false);
        let titles: Vec<&str> = reviews.iter().map(|review| review.title.as_str()).collect();
        assert_eq!(titles, vec!["updated-early", "updated-late"]);
    }

    #[rstest]
    fn commented_sort_ranks_uncommented_reviews_first() {
        let quiet = dated_review("quiet", 15);
        let mut early_comment = testing::with_last_comment(
            dated_review("early comment", 1),
            "reviewer",
            "first note",
        );
        if let Some(comment) = early_comment.last_comment.as_mut() {
            comment.created_at = chrono::Utc.with_ymd_and_hms(2017, 3, 1, 0, 0, 0).unwrap();
        }
        let mut late_comment = testing::with_last_comment(
            dated_review("late comment", 2),
            "reviewer",
            "second note",
        );
        if let Some(comment) = late_comment.last_comment.as_mut() {
            comment.created_at = chrono::Utc.with_ymd_and_hms(2017, 4, 1, 0, 0, 0).unwrap();
        }

        let mut reviews = vec![late_comment, quiet, early_comment];
        sort_reviews(&mut reviews, SortField::Commented, false);
        let titles: Vec<&str> = reviews.iter().map(|review| review.title.as_str()).collect();
        assert_eq!(titles, vec!["quiet", "early comment", "late comment"]);
    }
}
