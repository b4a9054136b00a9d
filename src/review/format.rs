//! Rendering of review records into report text.
//!
//! Three console styles are selectable from the CLI: `oneline` packs a
//! review into a single sentence, `indented` spreads it over tab-indented
//! lines, and `json` emits a pretty-printed array. A fourth style carrying
//! IRC control codes is reserved for the IRC sink.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::duration::format_duration;
use super::{LastComment, Review};
use crate::error::HarvestError;

/// Width comment bodies are wrapped to in the indented style.
const COMMENT_WRAP_WIDTH: usize = 70;

/// Console report styles selectable from the CLI and the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One sentence per review.
    Oneline,
    /// Tab-indented block per review.
    Indented,
    /// Pretty-printed JSON array.
    Json,
}

impl OutputFormat {
    /// Lowercase name as it appears on the command line.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Oneline => "oneline",
            Self::Indented => "indented",
            Self::Json => "json",
        }
    }
}

/// JSON projection of a review, keys in report order.
#[derive(Serialize)]
struct JsonReview<'a> {
    user: &'a str,
    title: &'a str,
    url: &'a str,
    time: String,
    updated_time: String,
    comments: usize,
    #[serde(rename = "type")]
    kind: &'static str,
    image: &'a str,
    project_name: &'a str,
    project_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_comment: Option<JsonLastComment<'a>>,
}

/// JSON projection of the latest comment.
#[derive(Serialize)]
struct JsonLastComment<'a> {
    author: &'a str,
    body: &'a str,
    created_at: String,
}

impl<'a> From<&'a LastComment> for JsonLastComment<'a> {
    fn from(comment: &'a LastComment) -> Self {
        Self {
            author: &comment.author,
            body: &comment.body,
            created_at: report_timestamp(comment.created_at),
        }
    }
}

impl Review {
    /// Render the review as a single sentence.
    ///
    /// The comment count clause appears when the review has comments, and
    /// the latest comment is named whenever one exists.
    #[must_use]
    pub fn format_oneline(&self, now: DateTime<Utc>) -> String {
        let mut line = format!(
            "{} filed '{}' {} {} ago",
            self.user,
            self.title,
            self.url,
            format_duration(self.time, now)
        );
        push_comment_count(&mut line, self.comments);
        if let Some(comment) = &self.last_comment {
            line.push_str(&format!(
                ", last comment by {} {} ago",
                comment.author,
                format_duration(comment.created_at, now)
            ));
        }
        line
    }

    /// Render the review as a tab-indented block.
    ///
    /// With `show_last_comment` set and a latest comment present, the
    /// comment count line names the comment author and is followed by the
    /// comment body wrapped to 70 columns.
    #[must_use]
    pub fn format_indented(&self, show_last_comment: Option<u32>, now: DateTime<Utc>) -> String {
        let mut text = format!(
            "{} filed '{}'\n\t{}\n\t{} ago",
            self.user,
            self.title,
            self.url,
            format_duration(self.time, now)
        );
        if self.comments > 0 {
            text.push_str("\n\t");
            push_comment_count_bare(&mut text, self.comments);
            if let (Some(comment), Some(_)) = (&self.last_comment, show_last_comment) {
                text.push_str(&format!(
                    ", last comment by {} {} ago\n",
                    comment.author,
                    format_duration(comment.created_at, now)
                ));
                text.push_str(&wrap_comment_body(&comment.body));
            }
        }
        text
    }

    /// Render the review with IRC bold and colour control codes.
    #[must_use]
    pub fn format_irc(&self, now: DateTime<Utc>) -> String {
        let mut line = format!(
            "\x02{}\x02 filed \x02'{}'\x02 \x0312{}\x03 {} ago",
            self.user,
            self.title,
            self.url,
            format_duration(self.time, now)
        );
        push_comment_count(&mut line, self.comments);
        if let Some(comment) = &self.last_comment {
            line.push_str(&format!(
                ", last comment by \x02{}\x02 {} ago",
                comment.author,
                format_duration(comment.created_at, now)
            ));
        }
        line
    }

    /// Render the review as a pretty-printed JSON object.
    ///
    /// The `last_comment` key appears only when `show_last_comment` is set
    /// and the review has a latest comment.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Io`] when serialization fails.
    pub fn format_json(&self, show_last_comment: Option<u32>) -> Result<String, HarvestError> {
        let last_comment = match (&self.last_comment, show_last_comment) {
            (Some(comment), Some(_)) => Some(JsonLastComment::from(comment)),
            _ => None,
        };
        let record = JsonReview {
            user: &self.user,
            title: &self.title,
            url: &self.url,
            time: report_timestamp(self.time),
            updated_time: report_timestamp(self.updated_time),
            comments: self.comments,
            kind: self.source.label(),
            image: &self.image,
            project_name: &self.project_name,
            project_url: &self.project_url,
            last_comment,
        };
        serde_json::to_string_pretty(&record).map_err(|error| HarvestError::Io {
            message: error.to_string(),
        })
    }
}

/// Write the formatted report for a batch of reviews.
///
/// Oneline and indented styles print one block per review. JSON prints a
/// single array with a pretty-printed object per review.
///
/// # Errors
///
/// Returns [`HarvestError::Io`] when the writer fails.
pub fn write_report<W: Write>(
    writer: &mut W,
    reviews: &[Review],
    format: OutputFormat,
    show_last_comment: Option<u32>,
    now: DateTime<Utc>,
) -> Result<(), HarvestError> {
    match format {
        OutputFormat::Json => {
            writeln!(writer, "[")?;
            let last_index = reviews.len().saturating_sub(1);
            for (index, review) in reviews.iter().enumerate() {
                let record = review.format_json(show_last_comment)?;
                if index < last_index {
                    writeln!(writer, "{record},")?;
                } else {
                    writeln!(writer, "{record}")?;
                }
            }
            writeln!(writer, "]")?;
        }
        OutputFormat::Oneline => {
            for review in reviews {
                writeln!(writer, "{}", review.format_oneline(now))?;
            }
        }
        OutputFormat::Indented => {
            for review in reviews {
                writeln!(writer, "{}", review.format_indented(show_last_comment, now))?;
            }
        }
    }
    Ok(())
}

/// One decorated line per review for the IRC sink.
#[must_use]
pub fn irc_lines(reviews: &[Review], now: DateTime<Utc>) -> Vec<String> {
    reviews.iter().map(|review| review.format_irc(now)).collect()
}

/// Indented rendering of the whole batch for the mail sink, one blank
/// line between reviews.
#[must_use]
pub fn email_body(reviews: &[Review], show_last_comment: Option<u32>, now: DateTime<Utc>) -> String {
    reviews
        .iter()
        .map(|review| review.format_indented(show_last_comment, now))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Timestamp string used in JSON output.
fn report_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Append `, 1 comment` or `, N comments` when the review has comments.
fn push_comment_count(line: &mut String, comments: usize) {
    if comments > 0 {
        line.push_str(", ");
        push_comment_count_bare(line, comments);
    }
}

/// Append `1 comment` or `N comments` without a leading separator.
fn push_comment_count_bare(line: &mut String, comments: usize) {
    if comments == 1 {
        line.push_str("1 comment");
    } else {
        line.push_str(&format!("{comments} comments"));
    }
}

/// Wrap a comment body to the report width, one tab-prefixed line each.
fn wrap_comment_body(body: &str) -> String {
    wrap_text(body, COMMENT_WRAP_WIDTH)
        .iter()
        .map(|line| format!("\t{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Greedy word wrap; words longer than the width are split hard.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0_usize;
    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            for ch in word.chars() {
                if current_len == width {
                    lines.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(ch);
                current_len += 1;
            }
            continue;
        }
        let needed = if current.is_empty() {
            word_len
        } else {
            word_len + 1
        };
        if current_len + needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len += needed;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Tests panic on failure")]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::review::testing;

    fn report_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 2, 1, 0, 0, 0).unwrap()
    }

    fn single_comment_review() -> Review {
        testing::review("dummy_title")
    }

    fn commented_review() -> Review {
        let mut review = testing::with_last_comment(
            testing::review("dummy_title"),
            "dummy_author",
            "last comment body",
        );
        review.comments = 10;
        review
    }

    #[rstest]
    fn oneline_with_one_comment() {
        assert_eq!(
            single_comment_review().format_oneline(report_now()),
            "dummy_user filed 'dummy_title' dummy_url 1 month ago, 1 comment"
        );
    }

    #[rstest]
    fn oneline_without_comments() {
        let mut review = single_comment_review();
        review.comments = 0;
        assert_eq!(
            review.format_oneline(report_now()),
            "dummy_user filed 'dummy_title' dummy_url 1 month ago"
        );
    }

    #[rstest]
    fn oneline_names_last_comment_author() {
        assert_eq!(
            commented_review().format_oneline(report_now()),
            "dummy_user filed 'dummy_title' dummy_url 1 month ago, 10 comments, \
             last comment by dummy_author 30 days ago"
        );
    }

    #[rstest]
    fn indented_with_one_comment() {
        assert_eq!(
            single_comment_review().format_indented(None, report_now()),
            "dummy_user filed 'dummy_title'\n\tdummy_url\n\t1 month ago\n\t1 comment"
        );
    }

    #[rstest]
    fn indented_keeps_count_plain_without_flag() {
        assert_eq!(
            commented_review().format_indented(None, report_now()),
            "dummy_user filed 'dummy_title'\n\tdummy_url\n\t1 month ago\n\t10 comments"
        );
    }

    #[rstest]
    fn indented_appends_wrapped_comment_body() {
        assert_eq!(
            commented_review().format_indented(Some(0), report_now()),
            "dummy_user filed 'dummy_title'\n\tdummy_url\n\t1 month ago\n\t10 comments, \
             last comment by dummy_author 30 days ago\n\tlast comment body"
        );
    }

    #[rstest]
    fn indented_with_empty_comment_body_keeps_trailing_newline() {
        let mut review = commented_review();
        if let Some(comment) = review.last_comment.as_mut() {
            comment.body = String::new();
        }
        assert_eq!(
            review.format_indented(Some(0), report_now()),
            "dummy_user filed 'dummy_title'\n\tdummy_url\n\t1 month ago\n\t10 comments, \
             last comment by dummy_author 30 days ago\n"
        );
    }

    #[rstest]
    fn irc_with_one_comment() {
        assert_eq!(
            single_comment_review().format_irc(report_now()),
            "\x02dummy_user\x02 filed \x02'dummy_title'\x02 \x0312dummy_url\x03 \
             1 month ago, 1 comment"
        );
    }

    #[rstest]
    fn irc_names_last_comment_author() {
        assert_eq!(
            commented_review().format_irc(report_now()),
            "\x02dummy_user\x02 filed \x02'dummy_title'\x02 \x0312dummy_url\x03 \
             1 month ago, 10 comments, last comment by \x02dummy_author\x02 30 days ago"
        );
    }

    #[rstest]
    fn json_includes_last_comment_only_when_shown() {
        let shown = commented_review().format_json(Some(0)).unwrap();
        let expected = "{\n  \"user\": \"dummy_user\",\n  \"title\": \"dummy_title\",\n  \
             \"url\": \"dummy_url\",\n  \"time\": \"2017-01-01 00:00:00\",\n  \
             \"updated_time\": \"2017-01-02 00:00:00\",\n  \"comments\": 10,\n  \
             \"type\": \"github\",\n  \"image\": \"dummy_image\",\n  \
             \"project_name\": \"dummy_project\",\n  \
             \"project_url\": \"dummy_project_url\",\n  \"last_comment\": {\n    \
             \"author\": \"dummy_author\",\n    \"body\": \"last comment body\",\n    \
             \"created_at\": \"2017-01-02 00:00:00\"\n  }\n}";
        assert_eq!(shown, expected);

        let hidden = commented_review().format_json(None).unwrap();
        assert!(!hidden.contains("last_comment"));
    }

    #[rstest]
    fn json_report_wraps_records_in_an_array() {
        let reviews = vec![single_comment_review(), single_comment_review()];
        let mut buffer = Vec::new();
        write_report(&mut buffer, &reviews, OutputFormat::Json, None, report_now()).unwrap();
        let report = String::from_utf8(buffer).unwrap();
        assert!(report.starts_with("[\n{\n"));
        assert!(report.ends_with("\n}\n]\n"));
        assert_eq!(report.matches("\"user\": \"dummy_user\"").count(), 2);
        assert_eq!(report.matches("},\n").count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
    }

    #[rstest]
    fn json_report_for_empty_batch_is_an_empty_array() {
        let mut buffer = Vec::new();
        write_report(&mut buffer, &[], OutputFormat::Json, None, report_now()).unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "[\n]\n");
    }

    #[rstest]
    fn oneline_report_prints_one_line_per_review() {
        let reviews = vec![single_comment_review(), single_comment_review()];
        let mut buffer = Vec::new();
        write_report(
            &mut buffer,
            &reviews,
            OutputFormat::Oneline,
            None,
            report_now(),
        )
        .unwrap();
        let report = String::from_utf8(buffer).unwrap();
        assert_eq!(report.lines().count(), 2);
    }

    #[rstest]
    fn irc_lines_decorate_every_review() {
        let lines = irc_lines(
            &[single_comment_review(), commented_review()],
            report_now(),
        );
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.starts_with("\x02dummy_user\x02")));
    }

    #[rstest]
    fn email_body_separates_reviews_with_a_blank_line() {
        let body = email_body(
            &[single_comment_review(), single_comment_review()],
            None,
            report_now(),
        );
        assert_eq!(body.matches("\n\n").count(), 1);
        assert_eq!(body.matches("dummy_user filed").count(), 2);
        assert!(!body.ends_with('\n'));
    }

    #[rstest]
    #[case::short_body("last comment body", vec!["last comment body"])]
    #[case::wraps_at_word_boundary(
        "this body is exactly long enough that the wrap point lands in between two words",
        vec![
            "this body is exactly long enough that the wrap point lands in between",
            "two words",
        ]
    )]
    #[case::collapses_interior_whitespace("one\n\ttwo   three", vec!["one two three"])]
    fn wraps_comment_bodies(#[case] body: &str, #[case] lines: Vec<&str>) {
        assert_eq!(wrap_text(body, 70), lines);
    }

    #[rstest]
    fn splits_words_longer_than_the_width() {
        let word = "a".repeat(75);
        let wrapped = wrap_text(&word, 70);
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped.first().map(String::len), Some(70));
        assert_eq!(wrapped.get(1).map(String::len), Some(5));
    }
}
