//! GitHub pull request adapter backed by Octocrab.

use http::StatusCode;
use octocrab::{Octocrab, Page};
use serde::Deserialize;

use super::FetchContext;
use crate::error::HarvestError;
use crate::review::{LastComment, Review, ServiceKind};

/// Harvests open pull requests for GitHub users, organizations, and
/// individual repositories.
pub struct GithubService {
    client: Octocrab,
}

/// API projection of a user or organization account.
#[derive(Debug, Default, Deserialize)]
struct ApiAccount {
    login: Option<String>,
    avatar_url: Option<String>,
}

/// API projection of a repository.
#[derive(Debug, Deserialize)]
struct ApiRepository {
    name: String,
    full_name: String,
    html_url: String,
}

/// API projection of a pull request.
#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    title: String,
    html_url: String,
    user: Option<ApiAccount>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// API projection of a review or issue comment.
#[derive(Debug, Deserialize)]
struct ApiComment {
    user: Option<ApiAccount>,
    body: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl GithubService {
    /// Build a service talking to the public GitHub API, authenticated when
    /// a token is configured.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Network`] when the client cannot be built.
    pub fn new(token: Option<&str>) -> Result<Self, HarvestError> {
        let mut builder = Octocrab::builder();
        if let Some(value) = token {
            builder = builder.personal_token(value.to_owned());
        }
        let client = builder
            .build()
            .map_err(|error| map_octocrab_error("build GitHub client", &error))?;
        Ok(Self { client })
    }

    /// Fetch open pull requests for a target, either `owner` alone or
    /// `owner/repository`.
    ///
    /// A bare owner fans out over every repository the account has. The
    /// owner is validated first, so an unknown account fails the whole
    /// target rather than each repository.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::NotFound`] for unknown owners and
    /// repositories, and the mapped API error otherwise.
    pub async fn request_reviews(
        &self,
        target: &str,
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        let (user_name, repo_name) = match target.split_once('/') {
            Some((user, repo)) => (user, Some(repo)),
            None => (target, None),
        };
        self.ensure_user(user_name).await?;
        let repositories = match repo_name {
            Some(name) => vec![self.fetch_repository(user_name, name).await?],
            None => self.list_repositories(user_name).await?,
        };
        let mut reviews = Vec::new();
        for repository in &repositories {
            reviews.extend(
                self.reviews_for_repository(user_name, repository, context)
                    .await?,
            );
        }
        Ok(reviews)
    }

    /// Confirm the owner account exists.
    async fn ensure_user(&self, user_name: &str) -> Result<(), HarvestError> {
        let route = format!("/users/{user_name}");
        match self.client.get::<ApiAccount, _, _>(route, None::<&()>).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Err(HarvestError::NotFound {
                message: format!("Invalid username/organizaton: {user_name}"),
            }),
            Err(error) => Err(map_octocrab_error("fetch user", &error)),
        }
    }

    /// Fetch one repository by owner and name.
    async fn fetch_repository(
        &self,
        user_name: &str,
        repo_name: &str,
    ) -> Result<ApiRepository, HarvestError> {
        let route = format!("/repos/{user_name}/{repo_name}");
        match self
            .client
            .get::<ApiRepository, _, _>(route, None::<&()>)
            .await
        {
            Ok(repository) => Ok(repository),
            Err(error) if is_not_found(&error) => Err(HarvestError::NotFound {
                message: format!("Repository {repo_name} not found for user {user_name}"),
            }),
            Err(error) => Err(map_octocrab_error("fetch repository", &error)),
        }
    }

    /// List every repository of an owner account.
    async fn list_repositories(&self, user_name: &str) -> Result<Vec<ApiRepository>, HarvestError> {
        let route = format!("/users/{user_name}/repos");
        let page = self
            .client
            .get::<Page<ApiRepository>, _, _>(route, None::<&()>)
            .await
            .map_err(|error| map_octocrab_error("list repositories", &error))?;
        self.client
            .all_pages(page)
            .await
            .map_err(|error| map_octocrab_error("list repositories", &error))
    }

    /// Reduce the open pull requests of one repository to review records.
    async fn reviews_for_repository(
        &self,
        user_name: &str,
        repository: &ApiRepository,
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        let route = format!("/repos/{}/pulls", repository.full_name);
        let page = match self
            .client
            .get::<Page<ApiPullRequest>, _, _>(route, Some(&[("state", "open")]))
            .await
        {
            Ok(page) => page,
            Err(error) if is_not_found(&error) => {
                return Err(HarvestError::NotFound {
                    message: format!(
                        "Repository {} not found for user {user_name}",
                        repository.name
                    ),
                });
            }
            Err(error) => return Err(map_octocrab_error("list pull requests", &error)),
        };
        let pulls = self
            .client
            .all_pages(page)
            .await
            .map_err(|error| map_octocrab_error("list pull requests", &error))?;

        let mut reviews = Vec::new();
        for pull in pulls {
            let ApiPullRequest {
                number,
                title,
                html_url,
                user,
                created_at,
                updated_at,
            } = pull;
            let (comments, last_comment) = self
                .comment_activity(&repository.full_name, number)
                .await?;
            if !context.accepts(created_at, last_comment.as_ref()) {
                continue;
            }
            let author = user.unwrap_or_default();
            reviews.push(Review {
                user: author.login.unwrap_or_default(),
                title,
                url: html_url,
                time: created_at,
                updated_time: updated_at.unwrap_or(created_at),
                comments,
                image: author.avatar_url.unwrap_or_default(),
                last_comment,
                project_name: repository.full_name.clone(),
                project_url: repository.html_url.clone(),
                source: ServiceKind::Github,
            });
        }
        Ok(reviews)
    }

    /// Count both comment streams of a pull request and pick the newest
    /// comment across them.
    ///
    /// GitHub serves review comments and issue comments separately, each in
    /// ascending order, so the last element of each stream is its newest.
    async fn comment_activity(
        &self,
        full_name: &str,
        number: u64,
    ) -> Result<(usize, Option<LastComment>), HarvestError> {
        let review_comments = self
            .fetch_comment_stream(format!("/repos/{full_name}/pulls/{number}/comments"))
            .await?;
        let issue_comments = self
            .fetch_comment_stream(format!("/repos/{full_name}/issues/{number}/comments"))
            .await?;
        let count = review_comments.len() + issue_comments.len();
        let newest_review = review_comments.into_iter().last();
        let newest_issue = issue_comments.into_iter().last();
        let newest = match (newest_review, newest_issue) {
            (Some(review), Some(issue)) => {
                if review.created_at > issue.created_at {
                    Some(review)
                } else {
                    Some(issue)
                }
            }
            (Some(review), None) => Some(review),
            (None, issue) => issue,
        };
        Ok((count, newest.map(into_last_comment)))
    }

    /// Fetch every page of one comment stream.
    async fn fetch_comment_stream(&self, route: String) -> Result<Vec<ApiComment>, HarvestError> {
        let page = self
            .client
            .get::<Page<ApiComment>, _, _>(route, None::<&()>)
            .await
            .map_err(|error| map_octocrab_error("list comments", &error))?;
        self.client
            .all_pages(page)
            .await
            .map_err(|error| map_octocrab_error("list comments", &error))
    }
}

/// Reduce an API comment to the shared last-comment shape.
fn into_last_comment(comment: ApiComment) -> LastComment {
    let ApiComment {
        user,
        body,
        created_at,
    } = comment;
    LastComment {
        author: user.and_then(|account| account.login).unwrap_or_default(),
        body: body.unwrap_or_default(),
        created_at,
    }
}

/// Checks if a GitHub error status indicates an authentication failure.
const fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

/// Checks if an octocrab error represents a network/transport issue.
const fn is_network_error(error: &octocrab::Error) -> bool {
    matches!(
        error,
        octocrab::Error::Http { .. }
            | octocrab::Error::Hyper { .. }
            | octocrab::Error::Service { .. }
    )
}

/// Checks if an octocrab error is a GitHub 404 response.
fn is_not_found(error: &octocrab::Error) -> bool {
    matches!(
        error,
        octocrab::Error::GitHub { source, .. } if source.status_code == StatusCode::NOT_FOUND
    )
}

/// Map an octocrab error onto the harvest taxonomy.
fn map_octocrab_error(operation: &str, error: &octocrab::Error) -> HarvestError {
    if let octocrab::Error::GitHub { source, .. } = error {
        return if is_auth_failure(source.status_code) {
            HarvestError::AuthFailed {
                message: format!(
                    "{operation}: GitHub returned {status} {message}",
                    status = source.status_code,
                    message = source.message
                ),
            }
        } else {
            HarvestError::Network {
                message: format!(
                    "{operation} failed with status {status}: {message}",
                    status = source.status_code,
                    message = source.message
                ),
            }
        };
    }

    if is_network_error(error) {
        return HarvestError::Network {
            message: format!("{operation} failed: {error}"),
        };
    }

    if matches!(
        error,
        octocrab::Error::Serde { .. } | octocrab::Error::Json { .. }
    ) {
        return HarvestError::Decode {
            message: format!("{operation} failed: {error}"),
        };
    }

    HarvestError::Network {
        message: format!("{operation} failed: {error}"),
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
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::review::age::Age;

    fn service_for(server: &MockServer) -> GithubService {
        let client = Octocrab::builder()
            .base_uri(server.uri())
            .expect("mock server URI should parse")
            .build()
            .expect("should build client");
        GithubService { client }
    }

    fn context() -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now: chrono::Utc
                .with_ymd_and_hms(2018, 6, 1, 0, 0, 0)
                .unwrap(),
        }
    }

    async fn mount_user(server: &MockServer, login: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/users/{login}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "login": login,
                "avatar_url": format!("https://avatars.example/{login}.png")
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn harvests_pull_requests_across_an_account() {
        let server = MockServer::start().await;
        mount_user(&server, "kedark").await;
        Mock::given(method("GET"))
            .and(path("/users/kedark/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "name": "testing",
                "full_name": "kedark/testing",
                "html_url": "https://github.com/kedark/testing"
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/kedark/testing/pulls"))
            .and(query_param("state", "open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "number": 7,
                "title": "Fix the flaky retry",
                "html_url": "https://github.com/kedark/testing/pull/7",
                "user": {
                    "login": "octocat",
                    "avatar_url": "https://avatars.example/octocat.png"
                },
                "created_at": "2018-05-01T10:00:00Z",
                "updated_at": "2018-05-20T08:30:00Z"
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/kedark/testing/pulls/7/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "user": { "login": "reviewer" },
                "body": "inline note",
                "created_at": "2018-05-02T10:00:00Z"
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/kedark/testing/issues/7/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "user": { "login": "discussant" },
                "body": "top level note",
                "created_at": "2018-05-19T10:00:00Z"
            }])))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews("kedark", &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 1);
        let review = reviews.first().expect("should have one review");
        assert_eq!(review.user, "octocat");
        assert_eq!(review.title, "Fix the flaky retry");
        assert_eq!(review.url, "https://github.com/kedark/testing/pull/7");
        assert_eq!(review.comments, 2);
        assert_eq!(review.project_name, "kedark/testing");
        assert_eq!(review.project_url, "https://github.com/kedark/testing");
        assert_eq!(review.image, "https://avatars.example/octocat.png");
        assert_eq!(review.source, ServiceKind::Github);
        let comment = review.last_comment.as_ref().expect("newest comment");
        assert_eq!(comment.author, "discussant");
        assert_eq!(comment.body, "top level note");
    }

    #[tokio::test]
    async fn unknown_user_fails_with_the_account_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/tom"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({ "message": "Not Found" })),
            )
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("tom", &context())
            .await
            .expect_err("unknown user should fail");

        assert_eq!(
            error,
            HarvestError::NotFound {
                message: String::from("Invalid username/organizaton: tom"),
            }
        );
    }

    #[tokio::test]
    async fn unknown_repository_fails_with_the_repository_message() {
        let server = MockServer::start().await;
        mount_user(&server, "kedark").await;
        Mock::given(method("GET"))
            .and(path("/repos/kedark/testing"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({ "message": "Not Found" })),
            )
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("kedark/testing", &context())
            .await
            .expect_err("unknown repository should fail");

        assert_eq!(
            error,
            HarvestError::NotFound {
                message: String::from("Repository testing not found for user kedark"),
            }
        );
    }

    #[tokio::test]
    async fn account_without_repositories_yields_no_reviews() {
        let server = MockServer::start().await;
        mount_user(&server, "kedark").await;
        Mock::given(method("GET"))
            .and(path("/users/kedark/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews("kedark", &context())
            .await
            .expect("harvest should succeed");
        assert!(reviews.is_empty());
    }

    #[tokio::test]
    async fn rejected_token_surfaces_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/tom"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({ "message": "Bad credentials" })),
            )
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("tom", &context())
            .await
            .expect_err("bad credentials should fail");
        assert!(matches!(error, HarvestError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn age_filter_drops_reviews_outside_the_window() {
        let server = MockServer::start().await;
        mount_user(&server, "kedark").await;
        Mock::given(method("GET"))
            .and(path("/users/kedark/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "name": "testing",
                "full_name": "kedark/testing",
                "html_url": "https://github.com/kedark/testing"
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/kedark/testing/pulls"))
            .and(query_param("state", "open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "number": 7,
                "title": "An old pull request",
                "html_url": "https://github.com/kedark/testing/pull/7",
                "user": { "login": "octocat" },
                "created_at": "2018-01-01T10:00:00Z",
                "updated_at": "2018-01-02T08:30:00Z"
            }])))
            .mount(&server)
            .await;
        for stream in [
            "/repos/kedark/testing/pulls/7/comments",
            "/repos/kedark/testing/issues/7/comments",
        ] {
            Mock::given(method("GET"))
                .and(path(stream))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
                .mount(&server)
                .await;
        }

        let mut harvest_context = context();
        let tokens = vec![String::from("newer"), String::from("30d")];
        harvest_context.age = Some(Age::parse(&tokens, harvest_context.now).unwrap());

        let reviews = service_for(&server)
            .request_reviews("kedark", &context())
            .await
            .expect("harvest should succeed");
        assert_eq!(reviews.len(), 1);

        let filtered = service_for(&server)
            .request_reviews("kedark", &harvest_context)
            .await
            .expect("harvest should succeed");
        assert!(filtered.is_empty());
    }
}
