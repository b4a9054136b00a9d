//! GitLab merge request adapter over the v4 REST API.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{
    FetchContext, TlsPolicy, expect_success, parse_platform_timestamp, read_json, transport_error,
};
use crate::error::HarvestError;
use crate::review::{LastComment, Review, ServiceKind};

/// Fallback image when neither the project nor its group carry an avatar.
const GITLAB_LOGO: &str = "https://docs.gitlab.com/assets/images/gitlab-logo.svg";

/// Timestamp format GitLab writes; `%.f` also accepts a missing fraction.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Harvests open merge requests for GitLab groups and individual projects.
pub struct GitlabService {
    client: reqwest::Client,
    host: Url,
    token: Option<String>,
}

/// API projection of a project.
#[derive(Debug, Deserialize)]
struct ApiProject {
    id: u64,
    name: String,
    web_url: String,
    avatar_url: Option<String>,
    namespace: Option<ApiNamespace>,
}

/// API projection of the namespace a project lives in.
#[derive(Debug, Deserialize)]
struct ApiNamespace {
    id: u64,
}

/// API projection of a group.
#[derive(Debug, Deserialize)]
struct ApiGroup {
    id: u64,
    avatar_url: Option<String>,
}

/// API projection of a merge request.
#[derive(Debug, Deserialize)]
struct ApiMergeRequest {
    iid: u64,
    title: String,
    web_url: String,
    author: ApiUser,
    created_at: String,
    updated_at: String,
    user_notes_count: usize,
}

/// API projection of a merge request or note author.
#[derive(Debug, Deserialize)]
struct ApiUser {
    username: String,
}

/// API projection of a merge request note.
///
/// Notes arrive newest first and include system entries for pushes, label
/// changes, and the like.
#[derive(Debug, Deserialize)]
struct ApiNote {
    system: bool,
    body: String,
    author: ApiUser,
    created_at: String,
}

impl GitlabService {
    /// Build a service for one GitLab host, authenticated when a token is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Configuration`] when the host is not a valid
    /// URL and the TLS policy errors otherwise.
    pub fn new(host: &str, token: Option<&str>, tls: &TlsPolicy) -> Result<Self, HarvestError> {
        let parsed = Url::parse(host).map_err(|error| HarvestError::Configuration {
            message: format!("invalid GitLab host '{host}': {error}"),
        })?;
        Ok(Self {
            client: tls.build_client()?,
            host: parsed,
            token: token.map(str::to_owned),
        })
    }

    /// Fetch open merge requests for a target, either a bare group name or
    /// `namespace/project`.
    ///
    /// A bare group fans out over every project the group owns.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::NotFound`] for unknown groups and projects,
    /// and the mapped API error otherwise.
    pub async fn request_reviews(
        &self,
        target: &str,
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        match target.split_once('/') {
            Some((user_name, repo_name)) => {
                let project = self.fetch_project(user_name, repo_name).await?;
                let image = match &project.avatar_url {
                    Some(avatar) => avatar.clone(),
                    None => self
                        .namespace_avatar(&project)
                        .await
                        .unwrap_or_else(|| String::from(GITLAB_LOGO)),
                };
                self.reviews_for_project(&project, &image, context).await
            }
            None => {
                let group = self.fetch_group(target).await?;
                let projects = self.list_group_projects(group.id).await?;
                let mut reviews = Vec::new();
                for project in &projects {
                    let image = project
                        .avatar_url
                        .clone()
                        .or_else(|| group.avatar_url.clone())
                        .unwrap_or_else(|| String::from(GITLAB_LOGO));
                    reviews.extend(self.reviews_for_project(project, &image, context).await?);
                }
                Ok(reviews)
            }
        }
    }

    /// Fetch one project by its namespaced path.
    async fn fetch_project(
        &self,
        user_name: &str,
        repo_name: &str,
    ) -> Result<ApiProject, HarvestError> {
        let url = self.api_url(&["projects", &format!("{user_name}/{repo_name}")])?;
        let response = self.send(url, "fetch project").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HarvestError::NotFound {
                message: format!("Project {repo_name} not found for user {user_name}"),
            });
        }
        read_json(expect_success(response, "fetch project")?, "fetch project").await
    }

    /// Fetch one group by name.
    async fn fetch_group(&self, group_name: &str) -> Result<ApiGroup, HarvestError> {
        let url = self.api_url(&["groups", group_name])?;
        let response = self.send(url, "fetch group").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(HarvestError::NotFound {
                message: format!("Invalid user/group name: {group_name}"),
            });
        }
        read_json(expect_success(response, "fetch group")?, "fetch group").await
    }

    /// List every project of a group.
    async fn list_group_projects(&self, group_id: u64) -> Result<Vec<ApiProject>, HarvestError> {
        let url = self.api_url(&["groups", &group_id.to_string(), "projects"])?;
        self.fetch_paged(url, "list group projects").await
    }

    /// Reduce the open merge requests of one project to review records.
    async fn reviews_for_project(
        &self,
        project: &ApiProject,
        image: &str,
        context: &FetchContext,
    ) -> Result<Vec<Review>, HarvestError> {
        let project_id = project.id.to_string();
        let mut url = self.api_url(&["projects", &project_id, "merge_requests"])?;
        url.query_pairs_mut().append_pair("state", "opened");
        let merge_requests: Vec<ApiMergeRequest> =
            self.fetch_paged(url, "list merge requests").await?;

        let mut reviews = Vec::new();
        for merge_request in merge_requests {
            let created =
                parse_gitlab_timestamp(&merge_request.created_at, "merge request created_at")?;
            let updated =
                parse_gitlab_timestamp(&merge_request.updated_at, "merge request updated_at")?;
            let last_comment = self.last_comment_for(&project_id, merge_request.iid).await?;
            if !context.accepts(created, last_comment.as_ref()) {
                continue;
            }
            reviews.push(Review {
                user: merge_request.author.username,
                title: merge_request.title,
                url: merge_request.web_url,
                time: created,
                updated_time: updated,
                comments: merge_request.user_notes_count,
                image: image.to_owned(),
                last_comment,
                project_name: project.name.clone(),
                project_url: project.web_url.clone(),
                source: ServiceKind::Gitlab,
            });
        }
        Ok(reviews)
    }

    /// Newest human note of one merge request.
    ///
    /// Notes arrive newest first, so the first non-system entry wins.
    async fn last_comment_for(
        &self,
        project_id: &str,
        merge_request_iid: u64,
    ) -> Result<Option<LastComment>, HarvestError> {
        let url = self.api_url(&[
            "projects",
            project_id,
            "merge_requests",
            &merge_request_iid.to_string(),
            "notes",
        ])?;
        let notes: Vec<ApiNote> = self.fetch_paged(url, "list notes").await?;
        for note in notes {
            if note.system {
                continue;
            }
            let created = parse_gitlab_timestamp(&note.created_at, "note created_at")?;
            return Ok(Some(LastComment {
                author: note.author.username,
                body: note.body,
                created_at: created,
            }));
        }
        Ok(None)
    }

    /// Avatar of the project's namespace group, when one resolves.
    ///
    /// Lookup failures fold into the caller's fallback image.
    async fn namespace_avatar(&self, project: &ApiProject) -> Option<String> {
        let namespace = project.namespace.as_ref()?;
        let url = self.api_url(&["groups", &namespace.id.to_string()]).ok()?;
        let response = self.send(url, "fetch namespace").await.ok()?;
        let successful = expect_success(response, "fetch namespace").ok()?;
        let group: ApiGroup = read_json(successful, "fetch namespace").await.ok()?;
        group.avatar_url
    }

    /// Collect every page of a list endpoint, following `x-next-page`.
    async fn fetch_paged<T: DeserializeOwned>(
        &self,
        base: Url,
        operation: &str,
    ) -> Result<Vec<T>, HarvestError> {
        let mut items = Vec::new();
        let mut page = 1_u32;
        loop {
            let mut url = base.clone();
            url.query_pairs_mut()
                .append_pair("per_page", "100")
                .append_pair("page", &page.to_string());
            let response = expect_success(self.send(url, operation).await?, operation)?;
            let next = response
                .headers()
                .get("x-next-page")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u32>().ok());
            let mut batch: Vec<T> = read_json(response, operation).await?;
            items.append(&mut batch);
            match next {
                Some(value) if value > page => page = value,
                _ => break,
            }
        }
        Ok(items)
    }

    /// Issue one authenticated GET request.
    async fn send(&self, url: Url, operation: &str) -> Result<reqwest::Response, HarvestError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header("PRIVATE-TOKEN", token);
        }
        request
            .send()
            .await
            .map_err(|error| transport_error(operation, &error))
    }

    /// Build an API v4 URL from path segments.
    ///
    /// A segment containing `/` is percent-encoded whole, which is how
    /// GitLab addresses projects by their namespaced path.
    fn api_url(&self, segments: &[&str]) -> Result<Url, HarvestError> {
        let mut url = self.host.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| HarvestError::Configuration {
                    message: format!("GitLab host '{}' cannot carry a path", self.host),
                })?;
            path.pop_if_empty().extend(["api", "v4"]).extend(segments);
        }
        Ok(url)
    }
}

/// Parse a GitLab timestamp, with or without fractional seconds.
fn parse_gitlab_timestamp(raw: &str, context: &str) -> Result<DateTime<Utc>, HarvestError> {
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
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn service_for(server: &MockServer) -> GitlabService {
        GitlabService::new(&server.uri(), Some("sometoken"), &TlsPolicy::Verify)
            .expect("should build service")
    }

    fn context() -> FetchContext {
        FetchContext {
            age: None,
            show_last_comment: None,
            now: chrono::Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    #[rstest]
    fn parses_timestamps_with_a_fraction() {
        let parsed = parse_gitlab_timestamp("2016-01-21T10:43:42.973Z", "test").unwrap();
        let expected = chrono::Utc.with_ymd_and_hms(2016, 1, 21, 10, 43, 42).unwrap()
            + chrono::Duration::milliseconds(973);
        assert_eq!(parsed, expected);
    }

    #[rstest]
    fn parses_timestamps_without_a_fraction() {
        let parsed = parse_gitlab_timestamp("2016-01-21T10:43:42Z", "test").unwrap();
        let expected = chrono::Utc.with_ymd_and_hms(2016, 1, 21, 10, 43, 42).unwrap();
        assert_eq!(parsed, expected);
    }

    #[tokio::test]
    async fn harvests_merge_requests_of_a_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/testns%2Ftestrepo"))
            .and(header("PRIVATE-TOKEN", "sometoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 11,
                "name": "testrepo",
                "web_url": "https://gitlab.example/testns/testrepo",
                "avatar_url": "https://gitlab.example/testrepo.png",
                "namespace": { "id": 42 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/11/merge_requests"))
            .and(query_param("state", "opened"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "iid": 4,
                "title": "Update ansible role",
                "web_url": "https://gitlab.example/testns/testrepo/merge_requests/4",
                "author": { "username": "mkumari" },
                "created_at": "2018-05-01T10:00:00Z",
                "updated_at": "2018-05-20T08:30:00Z",
                "user_notes_count": 3
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/11/merge_requests/4/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "system": true,
                    "body": "added 1 commit",
                    "author": { "username": "mkumari" },
                    "created_at": "2018-05-21T09:00:00Z"
                },
                {
                    "system": false,
                    "body": "please rebase",
                    "author": { "username": "reviewer" },
                    "created_at": "2018-05-19T10:00:00Z"
                }
            ])))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews("testns/testrepo", &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 1);
        let review = reviews.first().expect("should have one review");
        assert_eq!(review.user, "mkumari");
        assert_eq!(review.title, "Update ansible role");
        assert_eq!(
            review.url,
            "https://gitlab.example/testns/testrepo/merge_requests/4"
        );
        assert_eq!(review.comments, 3);
        assert_eq!(review.image, "https://gitlab.example/testrepo.png");
        assert_eq!(review.project_name, "testrepo");
        assert_eq!(review.project_url, "https://gitlab.example/testns/testrepo");
        assert_eq!(review.source, ServiceKind::Gitlab);
        assert_eq!(
            review.time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            review.updated_time,
            chrono::Utc.with_ymd_and_hms(2018, 5, 20, 8, 30, 0).unwrap()
        );
        let comment = review.last_comment.as_ref().expect("non-system note");
        assert_eq!(comment.author, "reviewer");
        assert_eq!(comment.body, "please rebase");
    }

    #[tokio::test]
    async fn harvests_every_project_of_a_group_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/dream-team"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 7,
                "avatar_url": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/7/projects"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-next-page", "2")
                    .set_body_json(serde_json::json!([{
                        "id": 1,
                        "name": "alpha",
                        "web_url": "https://gitlab.example/dream-team/alpha",
                        "avatar_url": null,
                        "namespace": { "id": 7 }
                    }])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/7/projects"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": 2,
                "name": "beta",
                "web_url": "https://gitlab.example/dream-team/beta",
                "avatar_url": "https://gitlab.example/beta.png",
                "namespace": { "id": 7 }
            }])))
            .mount(&server)
            .await;
        for (project_id, merge_request) in [
            (
                1,
                serde_json::json!({
                    "iid": 10,
                    "title": "Alpha change",
                    "web_url": "https://gitlab.example/dream-team/alpha/merge_requests/10",
                    "author": { "username": "jsmith" },
                    "created_at": "2018-05-01T10:00:00Z",
                    "updated_at": "2018-05-01T10:00:00Z",
                    "user_notes_count": 0
                }),
            ),
            (
                2,
                serde_json::json!({
                    "iid": 20,
                    "title": "Beta change",
                    "web_url": "https://gitlab.example/dream-team/beta/merge_requests/20",
                    "author": { "username": "jdoe" },
                    "created_at": "2018-05-02T10:00:00Z",
                    "updated_at": "2018-05-02T10:00:00Z",
                    "user_notes_count": 0
                }),
            ),
        ] {
            Mock::given(method("GET"))
                .and(path(format!("/api/v4/projects/{project_id}/merge_requests")))
                .and(query_param("state", "opened"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(serde_json::json!([merge_request])),
                )
                .mount(&server)
                .await;
        }
        for (project_id, iid) in [(1, 10), (2, 20)] {
            Mock::given(method("GET"))
                .and(path(format!(
                    "/api/v4/projects/{project_id}/merge_requests/{iid}/notes"
                )))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
                .mount(&server)
                .await;
        }

        let reviews = service_for(&server)
            .request_reviews("dream-team", &context())
            .await
            .expect("harvest should succeed");

        assert_eq!(reviews.len(), 2);
        let alpha = reviews.first().expect("alpha review");
        assert_eq!(alpha.title, "Alpha change");
        assert_eq!(alpha.image, GITLAB_LOGO);
        assert!(alpha.last_comment.is_none());
        let beta = reviews.get(1).expect("beta review");
        assert_eq!(beta.title, "Beta change");
        assert_eq!(beta.image, "https://gitlab.example/beta.png");
    }

    #[tokio::test]
    async fn project_without_an_avatar_falls_back_to_its_group() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/testns%2Ftestrepo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 11,
                "name": "testrepo",
                "web_url": "https://gitlab.example/testns/testrepo",
                "avatar_url": null,
                "namespace": { "id": 42 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 42,
                "avatar_url": "https://gitlab.example/group.png"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/11/merge_requests"))
            .and(query_param("state", "opened"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "iid": 4,
                "title": "Update ansible role",
                "web_url": "https://gitlab.example/testns/testrepo/merge_requests/4",
                "author": { "username": "mkumari" },
                "created_at": "2018-05-01T10:00:00Z",
                "updated_at": "2018-05-01T10:00:00Z",
                "user_notes_count": 0
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/11/merge_requests/4/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let reviews = service_for(&server)
            .request_reviews("testns/testrepo", &context())
            .await
            .expect("harvest should succeed");
        let review = reviews.first().expect("should have one review");
        assert_eq!(review.image, "https://gitlab.example/group.png");
    }

    #[tokio::test]
    async fn unknown_project_fails_with_the_project_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/foo%2Fbar"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "message": "404 Project Not Found"
            })))
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("foo/bar", &context())
            .await
            .expect_err("unknown project should fail");
        assert_eq!(
            error,
            HarvestError::NotFound {
                message: String::from("Project bar not found for user foo"),
            }
        );
    }

    #[tokio::test]
    async fn unknown_group_fails_with_the_group_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/unknown"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "message": "404 Group Not Found"
            })))
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("unknown", &context())
            .await
            .expect_err("unknown group should fail");
        assert_eq!(
            error,
            HarvestError::NotFound {
                message: String::from("Invalid user/group name: unknown"),
            }
        );
    }

    #[tokio::test]
    async fn rejected_token_surfaces_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/foo%2Fbar"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "message": "401 Unauthorized"
            })))
            .mount(&server)
            .await;

        let error = service_for(&server)
            .request_reviews("foo/bar", &context())
            .await
            .expect_err("bad token should fail");
        assert!(matches!(error, HarvestError::AuthFailed { .. }));
    }
}
