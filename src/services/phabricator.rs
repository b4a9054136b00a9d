//! Phabricator revision adapter over the Conduit API.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{FetchContext, TlsPolicy, expect_success, parse_epoch_seconds, read_json, transport_error};
use crate::error::HarvestError;
use crate::review::{LastComment, Review, ServiceKind};

/// Conduit code for a rejected API token.
const INVALID_AUTH_CODE: &str = "ERR-INVALID-AUTH";

/// Harvests open revisions a set of Phabricator users is responsible for.
pub struct PhabricatorService {
    client: reqwest::Client,
    host: Url,
    token: String,
    /// Users resolved so far, keyed by PHID and shared across targets.
    users: Mutex<HashMap<String, ApiConduitUser>>,
}

/// Envelope every Conduit response arrives in.
#[derive(Debug, Deserialize)]
struct ConduitEnvelope<T> {
    result: Option<T>,
    error_code: Option<String>,
    error_info: Option<String>,
}

/// API projection of a user, as `user.query` returns them.
#[derive(Debug, Clone, Deserialize)]
struct ApiConduitUser {
    phid: String,
    #[serde(rename = "userName")]
    user_name: String,
    image: Option<String>,
}

/// API projection of a revision.
#[derive(Debug, Deserialize)]
struct ApiRevision {
    id: String,
    title: String,
    uri: String,
    #[serde(rename = "dateCreated")]
    date_created: String,
    #[serde(rename = "dateModified")]
    date_modified: String,
    #[serde(rename = "authorPHID")]
    author_phid: String,
}

/// API projection of a revision comment, newest first.
#[derive(Debug, Deserialize)]
struct ApiRevisionComment {
    action: String,
    #[serde(rename = "authorPHID")]
    author_phid: String,
    #[serde(rename = "dateCreated")]
    date_created: String,
    #[serde(default)]
    content: String,
}

impl PhabricatorService {
    /// Build a service for one Phabricator host.
    ///
    /// The host may name the Conduit root directly or the instance root,
    /// with `/api` appended on demand.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Configuration`] when the host is not a valid
    /// URL and the TLS policy's error otherwise.
    pub fn new(host: &str, token: &str, tls: &TlsPolicy) -> Result<Self, HarvestError> {
        let parsed = Url::parse(host).map_err(|error| HarvestError::Configuration {
            message: format!("invalid Phabricator host '{host}': {error}"),
        })?;
        Ok(Self {
            client: tls.build_client()?,
            host: parsed,
            token: token.to_owned(),
            users: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch the open revisions the configured users are responsible for.
    ///
    /// An empty user list harvests every open revision on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::AuthFailed`] for rejected tokens and the
    /// mapped Conduit error otherwise.
    pub async fn request_reviews(
        &self,
        user_names: &[String],
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        let phids = self.seed_users(user_names).await?;
        let mut params = serde_json::Map::new();
        params.insert(
            String::from("status"),
            serde_json::Value::String(String::from("status-open")),
        );
        if !phids.is_empty() {
            params.insert(String::from("responsibleUsers"), serde_json::json!(phids));
        }
        let revisions: Vec<ApiRevision> = self
            .call("differential.query", serde_json::Value::Object(params))
            .await?;

        let base = self.display_base();
        let mut reviews = Vec::new();
        for revision in revisions {
            let comments = self.revision_comments(&revision.id).await?;
            let last_comment = match comments.first() {
                Some(comment) => Some(self.reduce_comment(comment).await?),
                None => None,
            };
            let created = parse_epoch_seconds(&revision.date_created, "revision dateCreated")?;
            let updated = parse_epoch_seconds(&revision.date_modified, "revision dateModified")?;
            if !context.accepts(created, last_comment.as_ref()) {
                continue;
            }
            let author = self.user_for(&revision.author_phid).await?;
            reviews.push(Review {
                user: author.user_name,
                title: revision.title,
                url: revision.uri,
                time: created,
                updated_time: updated,
                comments: comments.len(),
                image: author.image.unwrap_or_default(),
                last_comment,
                project_name: String::from("Phabricator"),
                project_url: base.clone(),
                source: ServiceKind::Phabricator,
            });
        }
        Ok(reviews)
    }

    /// Resolve configured usernames to PHIDs, priming the user cache.
    async fn seed_users(&self, user_names: &[String]) -> Result<Vec<String>, HarvestError> {
        if user_names.is_empty() {
            return Ok(Vec::new());
        }
        let params = serde_json::json!({ "usernames": user_names });
        let users: Vec<ApiConduitUser> = self.call("user.query", params).await?;
        let mut phids = Vec::with_capacity(users.len());
        let mut cache = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        for user in users {
            phids.push(user.phid.clone());
            cache.insert(user.phid.clone(), user);
        }
        Ok(phids)
    }

    /// Human comments of one revision, newest first.
    async fn revision_comments(
        &self,
        revision_id: &str,
    ) -> Result<Vec<ApiRevisionComment>, HarvestError> {
        let id = revision_id
            .parse::<u64>()
            .map_err(|error| HarvestError::Decode {
                message: format!(
                    "differential.getrevisioncomments: bad revision id '{revision_id}': {error}"
                ),
            })?;
        let params = serde_json::json!({ "ids": [id] });
        let mut threads: HashMap<String, Vec<ApiRevisionComment>> = self
            .call("differential.getrevisioncomments", params)
            .await?;
        let thread = threads.remove(revision_id).unwrap_or_default();
        Ok(thread
            .into_iter()
            .filter(|comment| comment.action == "comment")
            .collect())
    }

    /// Reduce a Conduit comment to the shared last-comment shape.
    async fn reduce_comment(
        &self,
        comment: &ApiRevisionComment,
    ) -> Result<LastComment, HarvestError> {
        let author = self.user_for(&comment.author_phid).await?;
        Ok(LastComment {
            author: author.user_name,
            body: comment.content.clone(),
            created_at: parse_epoch_seconds(&comment.date_created, "comment dateCreated")?,
        })
    }

    /// Look a user up by PHID, querying once and caching the result.
    async fn user_for(&self, phid: &str) -> Result<ApiConduitUser, HarvestError> {
        {
            let cache = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(user) = cache.get(phid) {
                return Ok(user.clone());
            }
        }
        let params = serde_json::json!({ "phids": [phid] });
        let users: Vec<ApiConduitUser> = self.call("user.query", params).await?;
        let mut cache = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        for user in users {
            cache.insert(user.phid.clone(), user);
        }
        cache.get(phid).cloned().ok_or_else(|| HarvestError::Decode {
            message: format!("user.query: no user for PHID {phid}"),
        })
    }

    /// Issue one Conduit call, the token riding inside the params.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        mut params: serde_json::Value,
    ) -> Result<T, HarvestError> {
        if let Some(object) = params.as_object_mut() {
            object.insert(
                String::from("__conduit__"),
                serde_json::json!({ "token": self.token }),
            );
        }
        let url = self.method_url(method)?;
        let form = [
            ("params", params.to_string()),
            ("output", String::from("json")),
            ("__conduit__", String::from("true")),
        ];
        let response = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|error| transport_error(method, &error))?;
        let envelope: ConduitEnvelope<T> =
            read_json(expect_success(response, method)?, method).await?;
        if let Some(code) = envelope.error_code {
            return Err(conduit_error(
                method,
                &code,
                envelope.error_info.as_deref().unwrap_or_default(),
            ));
        }
        envelope.result.ok_or_else(|| HarvestError::Decode {
            message: format!("{method}: missing result"),
        })
    }

    /// URL of one Conduit method, appending `/api` unless the host already
    /// names it.
    fn method_url(&self, method: &str) -> Result<Url, HarvestError> {
        let base = self.host.as_str().trim_end_matches('/');
        let text = if base.ends_with("/api") {
            format!("{base}/{method}")
        } else {
            format!("{base}/api/{method}")
        };
        Url::parse(&text).map_err(|error| HarvestError::Configuration {
            message: format!("invalid Phabricator URL for '{method}': {error}"),
        })
    }

    /// Instance root shown as the project URL.
    fn display_base(&self) -> String {
        let base = self.host.as_str().trim_end_matches('/');
        base.strip_suffix("/api")
            .unwrap_or(base)
            .trim_end_matches('/')
            .to_owned()
    }
}

/// Map a Conduit error envelope onto the harvest taxonomy.
fn conduit_error(method: &str, code: &str, info: &str) -> HarvestError {
    if code == INVALID_AUTH_CODE {
        HarvestError::AuthFailed {
            message: format!("{method}: {info}"),
        }
    } else {
        HarvestError::Network {
            message: format!("{method}: {code}: {info}"),
        }
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
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn service_for(server: &MockServer) -> PhabricatorService {
        PhabricatorService {
            client: reqwest::Client::new(),
            host: Url::parse(&server.uri()).expect("mock server URI should parse"),
            token: String::from("api-sometoken"),
            users: Mutex::new(HashMap::new()),
        }
    }

    fn context() -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now: chrono::Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn envelope(result: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "result": result,
            "error_code": null,
            "error_info": null
        })
    }

    #[rstest]
    fn instance_root_drops_the_api_suffix() {
        let service = PhabricatorService {
            client: reqwest::Client::new(),
            host: Url::parse("https://phab.example/api/").unwrap(),
            token: String::from("api-sometoken"),
            users: Mutex::new(HashMap::new()),
        };
        assert_eq!(service.display_base(), "https://phab.example");
        assert_eq!(
            service.method_url("user.query").unwrap().as_str(),
            "https://phab.example/api/user.query"
        );
    }

    #[tokio::test]
    async fn harvests_revisions_for_the_configured_users() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/user.query"))
            .and(body_string_contains("usernames"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
                &serde_json::json!([{
                    "phid": "PHID-USER-1",
                    "userName": "jdoe",
                    "image": "https://phab.example/file/jdoe.png"
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/differential.query"))
            .and(body_string_contains("status-open"))
            .and(body_string_contains("responsibleUsers"))
            .and(body_string_contains("api-sometoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
                &serde_json::json!([{
                    "id": "123",
                    "title": "Fix timezone handling",
                    "uri": "https://phab.example/D123",
                    "dateCreated": "1525168800",
                    "dateModified": "1526805000",
                    "authorPHID": "PHID-USER-1"
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/differential.getrevisioncomments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
                &serde_json::json!({
                    "123": [
                        {
                            "action": "comment",
                            "authorPHID": "PHID-USER-2",
                            "dateCreated": "1526781000",
                            "content": "needs a rebase"
                        },
                        {
                            "action": "update",
                            "authorPHID": "PHID-USER-1",
                            "dateCreated": "1526700000",
                            "content": ""
                        },
                        {
                            "action": "comment",
                            "authorPHID": "PHID-USER-1",
                            "dateCreated": "1525255200",
                            "content": "older note"
                        }
                    ]
                }),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/user.query"))
            .and(body_string_contains("phids"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
                &serde_json::json!([{
                    "phid": "PHID-USER-2",
                    "userName": "reviewer",
                    "image": null
                }]),
            )))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews(&[String::from("jdoe")], &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 1);
        let review = reviews.first().expect("should have one review");
        assert_eq!(review.user, "jdoe");
        assert_eq!(review.title, "Fix timezone handling");
        assert_eq!(review.url, "https://phab.example/D123");
        assert_eq!(
            review.time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            review.updated_time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 20, 8, 30, 0).unwrap()
        );
        assert_eq!(review.comments, 2);
        assert_eq!(review.image, "https://phab.example/file/jdoe.png");
        assert_eq!(review.project_name, "Phabricator");
        assert_eq!(review.project_url, server.uri());
        assert_eq!(review.source, ServiceKind::Phabricator);
        let comment = review.last_comment.as_ref().expect("newest comment");
        assert_eq!(comment.author, "reviewer");
        assert_eq!(comment.body, "needs a rebase");
        assert_eq!(
            comment.created_at,
            chrono::Utc.with_ymd_and_hms(2018, 5, 20, 1, 50, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn no_configured_users_queries_unfiltered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/differential.query"))
            .and(body_string_contains("responsibleUsers"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/differential.query"))
            .and(body_string_contains("status-open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
                &serde_json::json!([
                    {
                        "id": "124",
                        "title": "Orphan revision",
                        "uri": "https://phab.example/D124",
                        "dateCreated": "1525168800",
                        "dateModified": "1525168800",
                        "authorPHID": "PHID-USER-9"
                    },
                    {
                        "id": "125",
                        "title": "Second orphan",
                        "uri": "https://phab.example/D125",
                        "dateCreated": "1525255200",
                        "dateModified": "1525255200",
                        "authorPHID": "PHID-USER-9"
                    }
                ]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/differential.getrevisioncomments"))
            .and(body_string_contains("124"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(envelope(&serde_json::json!({ "124": [] }))),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/differential.getrevisioncomments"))
            .and(body_string_contains("125"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(envelope(&serde_json::json!({ "125": [] }))),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/user.query"))
            .and(body_string_contains("phids"))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
                &serde_json::json!([{
                    "phid": "PHID-USER-9",
                    "userName": "someone",
                    "image": null
                }]),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews(&[], &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 2);
        let review = reviews.first().expect("first orphan");
        assert_eq!(review.user, "someone");
        assert_eq!(review.comments, 0);
        assert!(review.last_comment.is_none());
        assert_eq!(review.image, "");
    }

    #[tokio::test]
    async fn rejected_token_surfaces_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/user.query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": null,
                "error_code": "ERR-INVALID-AUTH",
                "error_info": "API token is invalid."
            })))
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews(&[String::from("jdoe")], &context())
            .await
            .expect_err("bad token should fail");
        assert_eq!(
            error,
            HarvestError::AuthFailed {
                message: String::from("user.query: API token is invalid."),
            }
        );
    }
}
