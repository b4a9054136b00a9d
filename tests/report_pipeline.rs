//! End-to-end harvest tests: a TOML config pointing at a mock Gerrit
//! host is loaded, merged with CLI arguments, harvested, sorted, and
//! rendered.

#![expect(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests panic on failure"
)]

use std::io::Write;

use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use lichen::config::{self, Cli, Settings};
use lichen::review::Review;
use lichen::review::format::{self, OutputFormat};
use lichen::{HarvestError, aggregate};
use tempfile::NamedTempFile;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn report_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap()
}

fn guarded(payload: &serde_json::Value) -> String {
    format!(")]}}'\n{payload}")
}

async fn mount_gerrit_project(server: &MockServer) {
    Mock::given(method("HEAD"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/testrepo"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(guarded(&serde_json::json!({ "name": "testrepo" }))),
        )
        .mount(server)
        .await;
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
        .mount(server)
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
        .mount(server)
        .await;
}

fn gerrit_config(host: &str, repos: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("should create temp config");
    writeln!(
        file,
        "[[git_services]]\ntype = \"gerrit\"\nhost = \"{host}\"\nrepos = [{repos}]"
    )
    .expect("should write temp config");
    file
}

fn settings_for(config_path: &std::path::Path, extra: &[&str]) -> Settings {
    let mut arguments = vec!["lichen", "-c"];
    let path_text = config_path.to_str().expect("path should be utf-8");
    arguments.push(path_text);
    arguments.extend_from_slice(extra);
    let cli = Cli::try_parse_from(arguments).expect("arguments should parse");
    let file = config::load_file(&cli.config_path()).expect("config should load");
    let settings = config::merge(&cli, file);
    settings.validate().expect("settings should validate");
    settings
}

async fn harvest(settings: &Settings) -> Result<Vec<Review>, HarvestError> {
    let tls = settings.tls_policy()?;
    let context = settings.fetch_context(report_now())?;
    let targets = aggregate::build_targets(&settings.git_services, &tls)?;
    let mut reviews = aggregate::harvest_all(&targets, &context).await?;
    aggregate::sort_reviews(&mut reviews, settings.sort, settings.reverse);
    Ok(reviews)
}

#[tokio::test]
async fn harvests_and_renders_a_gerrit_project() {
    let server = MockServer::start().await;
    mount_gerrit_project(&server).await;
    let file = gerrit_config(&server.uri(), "\"testrepo\"");

    let settings = settings_for(file.path(), &[]);
    let reviews = harvest(&settings).await.expect("harvest should succeed");

    let mut buffer = Vec::new();
    format::write_report(
        &mut buffer,
        &reviews,
        OutputFormat::Oneline,
        settings.show_last_comment,
        report_now(),
    )
    .expect("report should render");

    assert_eq!(
        String::from_utf8(buffer).unwrap(),
        format!(
            "dhritishikhar filed 'Add dockerfile' {}/12345 30 days 14 hours ago, \
             2 comments, last comment by zuul 12 days 14 hours ago\n",
            server.uri()
        )
    );
}

#[tokio::test]
async fn broken_targets_do_not_poison_the_run() {
    let server = MockServer::start().await;
    mount_gerrit_project(&server).await;
    let file = gerrit_config(&server.uri(), "\"missing\", \"testrepo\"");

    let settings = settings_for(file.path(), &[]);
    let reviews = harvest(&settings).await.expect("harvest should tolerate 404s");

    assert_eq!(reviews.len(), 1);
    assert_eq!(
        reviews.first().map(|review| review.title.as_str()),
        Some("Add dockerfile")
    );
}

#[tokio::test]
async fn age_filter_drops_fresh_changes() {
    let server = MockServer::start().await;
    mount_gerrit_project(&server).await;
    let file = gerrit_config(&server.uri(), "\"testrepo\"");

    let settings = settings_for(file.path(), &["--age", "older", "2y"]);
    let reviews = harvest(&settings).await.expect("harvest should succeed");

    assert!(reviews.is_empty());
}

#[tokio::test]
async fn json_report_round_trips_the_review() {
    let server = MockServer::start().await;
    mount_gerrit_project(&server).await;
    let file = gerrit_config(&server.uri(), "\"testrepo\"");

    let settings = settings_for(file.path(), &["-f", "json", "--show-last-comment", "0"]);
    let reviews = harvest(&settings).await.expect("harvest should succeed");

    let mut buffer = Vec::new();
    format::write_report(
        &mut buffer,
        &reviews,
        OutputFormat::Json,
        settings.show_last_comment,
        report_now(),
    )
    .expect("report should render");

    let report: serde_json::Value =
        serde_json::from_slice(&buffer).expect("report should be valid JSON");
    let records = report.as_array().expect("report should be an array");
    assert_eq!(records.len(), 1);
    let record = records.first().unwrap();
    assert_eq!(record.get("type"), Some(&serde_json::json!("gerrit")));
    assert_eq!(record.get("user"), Some(&serde_json::json!("dhritishikhar")));
    assert_eq!(
        record.get("time"),
        Some(&serde_json::json!("2018-05-01 10:00:00"))
    );
    assert_eq!(
        record
            .get("last_comment")
            .and_then(|comment| comment.get("body")),
        Some(&serde_json::json!("rebuild please"))
    );
}
