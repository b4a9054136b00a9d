//! Pagure pull request adapter for the hosted pagure.io instance.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use super::{FetchContext, TlsPolicy, parse_epoch_seconds, read_json, transport_error};
use crate::error::HarvestError;
use crate::review::{LastComment, Review, ServiceKind};

/// The hosted instance every target lives on.
const PAGURE_HOST: &str = "https://pagure.io";

/// Harvests open pull requests for Pagure repositories, with or without a
/// namespace.
pub struct PagureService {
    client: reqwest::Client,
    host: Url,
}

/// Envelope of the pull request listing.
#[derive(Debug, Deserialize)]
struct ApiPullRequestList {
    requests: Vec<ApiPullRequest>,
}

/// API projection of a pull request.
#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    id: u64,
    title: String,
    user: ApiUser,
    date_created: String,
    last_updated: Option<String>,
    #[serde(default)]
    comments: Vec<ApiComment>,
}

/// API projection of a pull request or comment author.
#[derive(Debug, Deserialize)]
struct ApiUser {
    name: String,
}

/// API projection of a pull request comment, oldest first.
#[derive(Debug, Deserialize)]
struct ApiComment {
    user: ApiUser,
    comment: String,
    date_created: String,
}

/// Envelope of the user detail endpoint.
#[derive(Debug, Deserialize)]
struct ApiUserDetails {
    user: ApiUserProfile,
}

/// API projection of a user profile.
#[derive(Debug, Deserialize)]
struct ApiUserProfile {
    avatar_url: Option<String>,
}

impl PagureService {
    /// Build a service talking to pagure.io.
    ///
    /// # Errors
    ///
    /// Returns the TLS policy's error when the client cannot be built.
    pub fn new(tls: &TlsPolicy) -> Result<Self, HarvestError> {
        let host = Url::parse(PAGURE_HOST).map_err(|error| HarvestError::Configuration {
            message: format!("invalid Pagure host '{PAGURE_HOST}': {error}"),
        })?;
        Ok(Self {
            client: tls.build_client()?,
            host,
        })
    }

    /// Fetch open pull requests for a repository reference, either
    /// `repository` or `namespace/repository`.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::NotFound`] when the repository or a comment
    /// author cannot be resolved, and the mapped API error otherwise.
    pub async fn request_reviews(
        &self,
        reference: &str,
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        let url = self.api_url(&format!("{reference}/pull-requests"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| transport_error("list pull requests", &error))?;
        if !response.status().is_success() {
            return Err(HarvestError::NotFound {
                message: String::from("No repo found. Please check the repo name in config file."),
            });
        }
        let listing: ApiPullRequestList = read_json(response, "list pull requests").await?;

        let base = self.display_base();
        let mut reviews = Vec::new();
        for request in listing.requests {
            let created = parse_epoch_seconds(&request.date_created, "pull request date_created")?;
            let updated = match &request.last_updated {
                Some(raw) => parse_epoch_seconds(raw, "pull request last_updated")?,
                None => created,
            };
            let last_comment = match request.comments.last() {
                Some(comment) => Some(LastComment {
                    author: comment.user.name.clone(),
                    body: comment.comment.clone(),
                    created_at: parse_epoch_seconds(
                        &comment.date_created,
                        "comment date_created",
                    )?,
                }),
                None => None,
            };
            if !context.accepts(created, last_comment.as_ref()) {
                continue;
            }
            let image = self.avatar_for(&request.user.name).await?;
            reviews.push(Review {
                user: request.user.name,
                title: request.title,
                url: format!("{base}/{reference}/pull-request/{id}", id = request.id),
                time: created,
                updated_time: updated,
                comments: request.comments.len(),
                image,
                last_comment,
                project_name: reference.to_owned(),
                project_url: format!("{base}/{reference}"),
                source: ServiceKind::Pagure,
            });
        }
        Ok(reviews)
    }

    /// Resolve a user's avatar, falling back to their libravatar when the
    /// profile carries none.
    async fn avatar_for(&self, username: &str) -> Result<String, HarvestError> {
        let url = self.api_url(&format!("user/{username}"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| transport_error("fetch user", &error))?;
        if !response.status().is_success() {
            return Err(HarvestError::NotFound {
                message: format!("User {username} not found!"),
            });
        }
        let details: ApiUserDetails = read_json(response, "fetch user").await?;
        Ok(details.user.avatar_url.map_or_else(
            || libravatar_for_openid(username),
            |avatar| sized_avatar(&avatar),
        ))
    }

    /// Build an API v0 URL for a path below the API root.
    fn api_url(&self, tail: &str) -> Result<Url, HarvestError> {
        let base = self.display_base();
        Url::parse(&format!("{base}/api/0/{tail}")).map_err(|error| {
            HarvestError::Configuration {
                message: format!("invalid Pagure URL for '{tail}': {error}"),
            }
        })
    }

    /// Host prefix for displayed review and project URLs.
    fn display_base(&self) -> &str {
        self.host.as_str().trim_end_matches('/')
    }
}

/// Rewrite an avatar URL's query to the 64 pixel retro variant.
fn sized_avatar(avatar: &str) -> String {
    match Url::parse(avatar) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .clear()
                .append_pair("s", "64")
                .append_pair("d", "retro");
            url.to_string()
        }
        Err(_) => avatar.to_owned(),
    }
}

/// Libravatar URL derived from the user's Fedora OpenID identity.
fn libravatar_for_openid(username: &str) -> String {
    let openid = format!("http://{username}.id.fedoraproject.org/");
    let digest = Sha256::digest(openid.as_bytes());
    format!(
        "https://seccdn.libravatar.org/avatar/{}?s=64&d=retro",
        hex::encode(digest)
    )
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn service_for(server: &MockServer) -> PagureService {
        PagureService {
            client: reqwest::Client::new(),
            host: Url::parse(&server.uri()).expect("mock server URI should parse"),
        }
    }

    fn context() -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now: chrono::Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    #[rstest]
    fn sized_avatar_replaces_the_query() {
        assert_eq!(
            sized_avatar("https://seccdn.libravatar.org/avatar/feed?s=16"),
            "https://seccdn.libravatar.org/avatar/feed?s=64&d=retro"
        );
    }

    #[rstest]
    fn libravatar_hashes_the_fedora_openid() {
        assert_eq!(
            libravatar_for_openid("jdoe"),
            "https://seccdn.libravatar.org/avatar/\
             e8f59ef5c00f427698fa88353b7ec501ea732951431137f1ccffb9f390ead962?s=64&d=retro"
        );
    }

    #[tokio::test]
    async fn harvests_pull_requests_of_a_namespaced_repository() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/testns/testrepo/pull-requests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requests": [{
                    "id": 123,
                    "title": "Port the CI job",
                    "user": { "name": "jdoe" },
                    "date_created": "1525168800",
                    "last_updated": "1526805000",
                    "comments": [
                        {
                            "user": { "name": "nirik" },
                            "comment": "first pass looks fine",
                            "date_created": "1525255200"
                        },
                        {
                            "user": { "name": "pingou" },
                            "comment": "needs a rebase",
                            "date_created": "1526781000"
                        }
                    ]
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/0/user/jdoe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user": { "avatar_url": "https://seccdn.libravatar.org/avatar/feed?s=16" }
            })))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews("testns/testrepo", &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 1);
        let review = reviews.first().expect("should have one review");
        assert_eq!(review.user, "jdoe");
        assert_eq!(review.title, "Port the CI job");
        assert_eq!(
            review.url,
            format!("{}/testns/testrepo/pull-request/123", server.uri())
        );
        assert_eq!(
            review.time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            review.updated_time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 20, 8, 30, 0).unwrap()
        );
        assert_eq!(review.comments, 2);
        assert_eq!(
            review.image,
            "https://seccdn.libravatar.org/avatar/feed?s=64&d=retro"
        );
        assert_eq!(review.project_name, "testns/testrepo");
        assert_eq!(
            review.project_url,
            format!("{}/testns/testrepo", server.uri())
        );
        assert_eq!(review.source, ServiceKind::Pagure);
        let comment = review.last_comment.as_ref().expect("newest comment");
        assert_eq!(comment.author, "pingou");
        assert_eq!(comment.body, "needs a rebase");
        assert_eq!(
            comment.created_at,
            chrono::Utc.with_ymd_and_hms(2018, 5, 20, 1, 50, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn bare_repository_reference_hits_the_top_level_route() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/testrepo/pull-requests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requests": [{
                    "id": 5,
                    "title": "A lonely change",
                    "user": { "name": "jdoe" },
                    "date_created": "1525168800",
                    "last_updated": "1525168800",
                    "comments": []
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/0/user/jdoe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user": { "avatar_url": null }
            })))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews("testrepo", &context())
            .await
            .expect("harvest should succeed");

        let review = reviews.first().expect("should have one review");
        assert_eq!(review.url, format!("{}/testrepo/pull-request/5", server.uri()));
        assert_eq!(review.comments, 0);
        assert!(review.last_comment.is_none());
        assert_eq!(review.image, libravatar_for_openid("jdoe"));
    }

    #[tokio::test]
    async fn unknown_repository_fails_with_the_config_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/missing/pull-requests"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "Project not found"
            })))
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("missing", &context())
            .await
            .expect_err("unknown repository should fail");
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
    async fn unknown_author_fails_with_the_user_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/0/testrepo/pull-requests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requests": [{
                    "id": 5,
                    "title": "A lonely change",
                    "user": { "name": "ghost" },
                    "date_created": "1525168800",
                    "last_updated": "1525168800",
                    "comments": []
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/0/user/ghost"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "User not found"
            })))
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("testrepo", &context())
            .await
            .expect_err("unknown author should fail");
        assert_eq!(
            error,
            HarvestError::NotFound {
                message: String::from("User ghost not found!"),
            }
        );
    }
}
