//! Gerrit change adapter over the anonymous REST API.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{
    FetchContext, TlsPolicy, decode_guarded_json, expect_success, gravatar_url,
    parse_platform_timestamp, transport_error,
};
use crate::error::HarvestError;
use crate::review::{LastComment, Review, ServiceKind};

/// Fallback image when the change owner has no email for a gravatar.
const GERRIT_LOGO: &str = "http://electric-cloud.com/wp-content/uploads/2014/09/EC-Gerrit.png";

/// Timestamp format Gerrit writes, nanosecond fraction included.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// The magic file Gerrit uses for commit message comment threads.
const COMMIT_MESSAGE_FILE: &str = "/COMMIT_MSG";

/// Reviewer gate applied to harvested changes.
///
/// A change only counts as waiting for review while somebody other than the
/// excluded identities is assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewersConfig {
    /// Drop changes with no reviewer left after exclusions.
    #[serde(default = "default_ensure")]
    pub ensure: bool,
    /// Reviewer identities that do not count, bot accounts mostly.
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Account field the excluded list names.
    #[serde(default = "default_id_key")]
    pub id_key: String,
}

impl Default for ReviewersConfig {
    fn default() -> Self {
        Self {
            ensure: true,
            excluded: Vec::new(),
            id_key: default_id_key(),
        }
    }
}

fn default_ensure() -> bool {
    true
}

fn default_id_key() -> String {
    String::from("username")
}

/// Harvests open changes for Gerrit projects.
pub struct GerritService {
    client: reqwest::Client,
    host: Url,
    reviewers: Option<ReviewersConfig>,
    /// Result of the one-off host probe, shared across targets.
    host_alive: Mutex<Option<bool>>,
}

/// API projection of a change.
#[derive(Debug, Deserialize)]
struct ApiChange {
    id: String,
    project: String,
    subject: String,
    created: String,
    updated: String,
    #[serde(rename = "_number")]
    number: u64,
    #[serde(default)]
    owner: ApiAccount,
    #[serde(default)]
    reviewers: ApiReviewers,
}

/// API projection of an account, detailed by `o=DETAILED_ACCOUNTS`.
#[derive(Debug, Default, Deserialize)]
struct ApiAccount {
    username: Option<String>,
    email: Option<String>,
    name: Option<String>,
    #[serde(rename = "_account_id")]
    account_id: Option<u64>,
}

/// Reviewer sets of a change, keyed by their role.
#[derive(Debug, Default, Deserialize)]
struct ApiReviewers {
    #[serde(rename = "REVIEWER", default)]
    reviewer: Vec<ApiAccount>,
}

/// One entry of a file's comment thread.
#[derive(Debug, Deserialize)]
struct ApiChangeComment {
    #[serde(default)]
    author: ApiAccount,
    message: String,
    updated: String,
}

/// Comment threads of a change, keyed by file path.
type ApiCommentsMap = BTreeMap<String, Vec<ApiChangeComment>>;

impl GerritService {
    /// Build a service for one Gerrit host.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Configuration`] when the host is not a valid
    /// URL and the TLS policy's error otherwise.
    pub fn new(
        host: &str,
        reviewers: Option<ReviewersConfig>,
        tls: &TlsPolicy,
    ) -> Result<Self, HarvestError> {
        let parsed = Url::parse(host).map_err(|error| HarvestError::Configuration {
            message: format!("invalid Gerrit host '{host}': {error}"),
        })?;
        Ok(Self {
            client: tls.build_client()?,
            host: parsed,
            reviewers,
            host_alive: Mutex::new(None),
        })
    }

    /// Fetch open changes for one project.
    ///
    /// The host is probed once per service and the result shared by every
    /// target, so a dead host fails each of them with the same message.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::NotFound`] for dead hosts and unknown
    /// projects, and the mapped API error otherwise.
    pub async fn request_reviews(
        &self,
        repo_name: &str,
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        self.ensure_host().await?;
        self.ensure_project(repo_name).await?;
        let changes = self.fetch_changes(repo_name).await?;

        let base = self.display_base().to_owned();
        let mut reviews = Vec::new();
        for change in changes {
            if !self.passes_reviewer_gate(&change) {
                continue;
            }
            let Some(threads) = self.fetch_comments(&change.id).await? else {
                continue;
            };
            let (comments, last_comment) = reduce_comments(&threads)?;
            let created = parse_gerrit_timestamp(&change.created, "change created")?;
            let updated = parse_gerrit_timestamp(&change.updated, "change updated")?;
            if !context.accepts(created, last_comment.as_ref()) {
                continue;
            }
            let image = change
                .owner
                .email
                .as_ref()
                .map_or_else(|| String::from(GERRIT_LOGO), |email| gravatar_url(email));
            reviews.push(Review {
                user: account_identity(&change.owner),
                title: change.subject,
                url: format!("{base}/{number}", number = change.number),
                time: created,
                updated_time: updated,
                comments,
                image,
                last_comment,
                project_name: change.project,
                project_url: base.clone(),
                source: ServiceKind::Gerrit,
            });
        }
        Ok(reviews)
    }

    /// Probe the host once and reuse the verdict for every target.
    async fn ensure_host(&self) -> Result<(), HarvestError> {
        let cached = {
            let guard = self
                .host_alive
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        };
        let alive = match cached {
            Some(value) => value,
            None => {
                let result = self.client.head(self.host.clone()).send().await;
                let value = matches!(&result, Ok(response) if response.status().is_success());
                let mut guard = self
                    .host_alive
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *guard = Some(value);
                value
            }
        };
        if alive {
            Ok(())
        } else {
            Err(HarvestError::NotFound {
                message: format!("Host {} does not exist", self.display_base()),
            })
        }
    }

    /// Confirm the project exists on the host.
    async fn ensure_project(&self, repo_name: &str) -> Result<(), HarvestError> {
        let mut url = self.host.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| HarvestError::Configuration {
                    message: format!("Gerrit host '{}' cannot carry a path", self.host),
                })?;
            path.pop_if_empty().push("projects").push(repo_name);
        }
        let response = self.send(url, "fetch project").await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HarvestError::NotFound {
                message: String::from("No repo found. Please check the repo name in config file."),
            })
        }
    }

    /// List the open changes of one project, accounts and labels detailed.
    async fn fetch_changes(&self, repo_name: &str) -> Result<Vec<ApiChange>, HarvestError> {
        let base = self.display_base();
        let query = format!(
            "{base}/changes/?q=project:{repo_name}+status:open&o=DETAILED_ACCOUNTS&o=DETAILED_LABELS"
        );
        let url = Url::parse(&query).map_err(|error| HarvestError::Configuration {
            message: format!("invalid Gerrit URL for '{repo_name}': {error}"),
        })?;
        let response = expect_success(self.send(url, "list changes").await?, "list changes")?;
        let body = response
            .text()
            .await
            .map_err(|error| transport_error("list changes", &error))?;
        decode_guarded_json(&body, "list changes")
    }

    /// Comment threads of one change, or `None` when the endpoint is
    /// missing and the change should be skipped.
    async fn fetch_comments(&self, change_id: &str) -> Result<Option<ApiCommentsMap>, HarvestError> {
        let base = self.display_base();
        let url = Url::parse(&format!("{base}/changes/{change_id}/comments")).map_err(|error| {
            HarvestError::Configuration {
                message: format!("invalid Gerrit URL for change '{change_id}': {error}"),
            }
        })?;
        let response = self.send(url, "list comments").await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!(change = change_id, "comments endpoint missing, skipping change");
            return Ok(None);
        }
        let body = expect_success(response, "list comments")?
            .text()
            .await
            .map_err(|error| transport_error("list comments", &error))?;
        Ok(Some(decode_guarded_json(&body, "list comments")?))
    }

    /// Apply the reviewer gate configured for this service.
    fn passes_reviewer_gate(&self, change: &ApiChange) -> bool {
        let Some(config) = &self.reviewers else {
            return true;
        };
        if !config.ensure {
            return true;
        }
        change.reviewers.reviewer.iter().any(|account| {
            reviewer_identity(account, &config.id_key)
                .is_none_or(|identity| !config.excluded.contains(&identity))
        })
    }

    /// Issue one GET request asking for JSON.
    async fn send(&self, url: Url, operation: &str) -> Result<reqwest::Response, HarvestError> {
        self.client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|error| transport_error(operation, &error))
    }

    /// Host prefix for displayed review and project URLs.
    fn display_base(&self) -> &str {
        self.host.as_str().trim_end_matches('/')
    }
}

/// Count the review comments of a change and pick the newest one.
///
/// Commit message threads do not count. Threads arrive oldest first, so the
/// candidates are each file's last entry.
fn reduce_comments(
    threads: &ApiCommentsMap,
) -> Result<(usize, Option<LastComment>), HarvestError> {
    let mut count = 0_usize;
    let mut newest: Option<LastComment> = None;
    for (file, thread) in threads {
        if file == COMMIT_MESSAGE_FILE {
            continue;
        }
        count += thread.len();
        if let Some(last) = thread.last() {
            let updated = parse_gerrit_timestamp(&last.updated, "comment updated")?;
            let replace = newest
                .as_ref()
                .is_none_or(|current| updated > current.created_at);
            if replace {
                newest = Some(LastComment {
                    author: account_identity(&last.author),
                    body: last.message.clone(),
                    created_at: updated,
                });
            }
        }
    }
    Ok((count, newest))
}

/// Display identity of an account, preferring the username.
fn account_identity(account: &ApiAccount) -> String {
    account
        .username
        .clone()
        .or_else(|| account.email.clone())
        .unwrap_or_default()
}

/// Account field the exclusion list is matched against.
fn reviewer_identity(account: &ApiAccount, id_key: &str) -> Option<String> {
    match id_key {
        "email" => account.email.clone(),
        "name" => account.name.clone(),
        "_account_id" => account.account_id.map(|id| id.to_string()),
        _ => account.username.clone(),
    }
}

/// Parse a Gerrit timestamp, fraction optional.
fn parse_gerrit_timestamp(raw: &str, context: &str) -> Result<DateTime<Utc>, HarvestError> {
    parse_platform_timestamp(raw, TIME_FORMAT, context)
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
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn service_for(server: &MockServer, reviewers: Option<ReviewersConfig>) -> GerritService {
        GerritService {
            client: reqwest::Client::new(),
            host: Url::parse(&server.uri()).expect("mock server URI should parse"),
            reviewers,
            host_alive: Mutex::new(None),
        }
    }

    fn context() -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now: chrono::Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn guarded(payload: &serde_json::Value) -> String {
        format!(")]}}'\n{payload}")
    }

    async fn mount_live_host(server: &MockServer) {
        Mock::given(method("HEAD"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    async fn mount_project(server: &MockServer, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/projects/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(guarded(&serde_json::json!({ "name": name }))),
            )
            .mount(server)
            .await;
    }

    #[rstest]
    fn parses_nanosecond_timestamps() {
        let parsed = parse_gerrit_timestamp("2018-05-01 10:00:00.000000000", "test").unwrap();
        assert_eq!(
            parsed,
            chrono::Utc.with_ymd_and_hms(2018, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[rstest]
    fn identity_prefers_username_over_email() {
        let account = ApiAccount {
            username: Some(String::from("jdoe")),
            email: Some(String::from("jdoe@example.com")),
            name: None,
            account_id: None,
        };
        assert_eq!(account_identity(&account), "jdoe");
        let email_only = ApiAccount {
            username: None,
            email: Some(String::from("jdoe@example.com")),
            name: None,
            account_id: None,
        };
        assert_eq!(account_identity(&email_only), "jdoe@example.com");
    }

    fn gate_change(reviewer: Vec<ApiAccount>) -> ApiChange {
        ApiChange {
            id: String::from("p~m~I0"),
            project: String::from("p"),
            subject: String::from("s"),
            created: String::from("2018-05-01 10:00:00.000000000"),
            updated: String::from("2018-05-01 10:00:00.000000000"),
            number: 1,
            owner: ApiAccount::default(),
            reviewers: ApiReviewers { reviewer },
        }
    }

    fn named_account(username: &str) -> ApiAccount {
        ApiAccount {
            username: Some(String::from(username)),
            email: None,
            name: None,
            account_id: None,
        }
    }

    fn offline_service(reviewers: Option<ReviewersConfig>) -> GerritService {
        GerritService {
            client: reqwest::Client::new(),
            host: Url::parse("https://gerrit.example").unwrap(),
            reviewers,
            host_alive: Mutex::new(None),
        }
    }

    #[rstest]
    fn reviewer_gate_checks_remaining_identities() {
        let service = offline_service(Some(ReviewersConfig {
            excluded: vec![String::from("jenkins")],
            ..ReviewersConfig::default()
        }));
        assert!(!service.passes_reviewer_gate(&gate_change(vec![named_account("jenkins")])));
        assert!(!service.passes_reviewer_gate(&gate_change(Vec::new())));
        assert!(service.passes_reviewer_gate(&gate_change(vec![
            named_account("jenkins"),
            named_account("reviewer1"),
        ])));
    }

    #[rstest]
    fn disabled_gate_keeps_unreviewed_changes() {
        let service = offline_service(Some(ReviewersConfig {
            ensure: false,
            ..ReviewersConfig::default()
        }));
        assert!(service.passes_reviewer_gate(&gate_change(Vec::new())));
    }

    #[tokio::test]
    async fn harvests_changes_of_a_project() {
        let server = MockServer::start().await;
        mount_live_host(&server).await;
        mount_project(&server, "testrepo").await;
        Mock::given(method("GET"))
            .and(path("/changes/"))
            .and(query_param("q", "project:testrepo status:open"))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(
                &serde_json::json!([{
                    "id": "testrepo~master~I8473b95934b573",
                    "project": "testrepo",
                    "subject": "Add dockerfile",
                    "created": "2018-05-01 10:00:00.000000000",
                    "updated": "2018-05-20 08:30:00.000000000",
                    "_number": 12345,
                    "owner": {
                        "username": "dhritishikhar",
                        "email": "dhriti@example.com"
                    },
                    "reviewers": {
                        "REVIEWER": [{ "username": "zuul" }]
                    }
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/changes/testrepo~master~I8473b95934b573/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(
                &serde_json::json!({
                    "/COMMIT_MSG": [{
                        "author": { "username": "zuul" },
                        "message": "commit message nit",
                        "updated": "2018-05-02 10:00:00.000000000"
                    }],
                    "Dockerfile": [
                        {
                            "author": { "username": "dhritishikhar" },
                            "message": "done",
                            "updated": "2018-05-03 10:00:00.000000000"
                        },
                        {
                            "author": { "username": "zuul" },
                            "message": "rebuild please",
                            "updated": "2018-05-19 10:00:00.000000000"
                        }
                    ]
                }),
            )))
            .mount(&server)
            .await;

        let reviews = service_for(&server, None)
            .request_reviews("testrepo", &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 1);
        let review = reviews.first().expect("should have one review");
        assert_eq!(review.user, "dhritishikhar");
        assert_eq!(review.title, "Add dockerfile");
        assert_eq!(review.url, format!("{}/12345", server.uri()));
        assert_eq!(
            review.time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            review.updated_time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 20, 8, 30, 0).unwrap()
        );
        assert_eq!(review.comments, 2);
        assert_eq!(review.image, gravatar_url("dhriti@example.com"));
        assert_eq!(review.project_name, "testrepo");
        assert_eq!(review.project_url, server.uri());
        assert_eq!(review.source, ServiceKind::Gerrit);
        let comment = review.last_comment.as_ref().expect("newest file comment");
        assert_eq!(comment.author, "zuul");
        assert_eq!(comment.body, "rebuild please");
    }

    #[tokio::test]
    async fn dead_host_fails_every_target() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let error = service_for(&server, None)
            .request_reviews("testrepo", &context())
            .await
            .expect_err("dead host should fail");
        assert_eq!(
            error,
            HarvestError::NotFound {
                message: format!("Host {} does not exist", server.uri()),
            }
        );
    }

    #[tokio::test]
    async fn unknown_project_fails_with_the_config_hint() {
        let server = MockServer::start().await;
        mount_live_host(&server).await;
        Mock::given(method("GET"))
            .and(path("/projects/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let error = service_for(&server, None)
            .request_reviews("missing", &context())
            .await
            .expect_err("unknown project should fail");
        assert_eq!(
            error,
            HarvestError::NotFound {
                message: String::from(
                    "No repo found. Please check the repo name in config file."
                ),
            }
        );
    }

    #[tokio::test]
    async fn change_without_a_comments_endpoint_is_skipped() {
        let server = MockServer::start().await;
        mount_live_host(&server).await;
        mount_project(&server, "testrepo").await;
        Mock::given(method("GET"))
            .and(path("/changes/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(
                &serde_json::json!([{
                    "id": "testrepo~master~I8473b95934b573",
                    "project": "testrepo",
                    "subject": "Add dockerfile",
                    "created": "2018-05-01 10:00:00.000000000",
                    "updated": "2018-05-20 08:30:00.000000000",
                    "_number": 12345,
                    "owner": { "username": "dhritishikhar" }
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/changes/testrepo~master~I8473b95934b573/comments"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let reviews = service_for(&server, None)
            .request_reviews("testrepo", &context())
            .await
            .expect("harvest should succeed");
        assert!(reviews.is_empty());
    }

    #[tokio::test]
    async fn reviewer_gate_drops_changes_left_to_excluded_accounts() {
        let server = MockServer::start().await;
        mount_live_host(&server).await;
        mount_project(&server, "testrepo").await;
        Mock::given(method("GET"))
            .and(path("/changes/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(
                &serde_json::json!([
                    {
                        "id": "testrepo~master~Iaaa",
                        "project": "testrepo",
                        "subject": "Only the bot is assigned",
                        "created": "2018-05-01 10:00:00.000000000",
                        "updated": "2018-05-01 10:00:00.000000000",
                        "_number": 1,
                        "owner": { "username": "author" },
                        "reviewers": { "REVIEWER": [{ "username": "jenkins" }] }
                    },
                    {
                        "id": "testrepo~master~Ibbb",
                        "project": "testrepo",
                        "subject": "A human is assigned too",
                        "created": "2018-05-02 10:00:00.000000000",
                        "updated": "2018-05-02 10:00:00.000000000",
                        "_number": 2,
                        "owner": { "username": "author" },
                        "reviewers": {
                            "REVIEWER": [
                                { "username": "jenkins" },
                                { "username": "reviewer1" }
                            ]
                        }
                    }
                ]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/changes/testrepo~master~Ibbb/comments"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(guarded(&serde_json::json!({}))),
            )
            .mount(&server)
            .await;

        let reviewers = ReviewersConfig {
            excluded: vec![String::from("jenkins")],
            ..ReviewersConfig::default()
        };
        let reviews = service_for(&server, Some(reviewers))
            .request_reviews("testrepo", &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 1);
        let review = reviews.first().expect("the human-reviewed change");
        assert_eq!(review.title, "A human is assigned too");
        assert_eq!(review.comments, 0);
        assert!(review.last_comment.is_none());
        assert_eq!(review.image, GERRIT_LOGO);
    }

    #[tokio::test]
    async fn host_probe_runs_once_per_service() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        mount_project(&server, "testrepo").await;
        Mock::given(method("GET"))
            .and(path("/changes/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(
                &serde_json::json!([]),
            )))
            .mount(&server)
            .await;

        let service = service_for(&server, None);
        for _ in 0..2 {
            let reviews = service
                .request_reviews("testrepo", &context())
                .await
                .expect("harvest should succeed");
            assert!(reviews.is_empty());
        }
    }
}
