//! Delivery of the finished report.
//!
//! Exactly one sink runs per invocation: the mail sink emails the
//! indented rendering, the IRC sink announces one decorated line per
//! review, and everything else prints to the console in the selected
//! format. Email wins over IRC when both are configured.

pub mod irc;
pub mod mailer;

pub use irc::IrcSink;
pub use mailer::Mailer;

use chrono::{DateTime, Utc};

use crate::config::Settings;
use crate::error::HarvestError;
use crate::review::Review;
use crate::review::format::{self, OutputFormat};

/// Deliver the report through the sink the settings select.
///
/// # Errors
///
/// Returns [`HarvestError::Configuration`] when a selected sink has no
/// configuration table and [`HarvestError::Io`] when delivery fails.
pub async fn deliver(
    settings: &Settings,
    reviews: &[Review],
    now: DateTime<Utc>,
) -> Result<(), HarvestError> {
    if let Some(recipients) = &settings.email {
        return deliver_email(settings, recipients, reviews, now).await;
    }
    if let Some(channels) = &settings.irc {
        return deliver_irc(settings, channels, reviews, now).await;
    }
    write_console(settings, reviews, now)
}

/// Print the report to standard output.
///
/// The oneline style is used when no format was selected.
///
/// # Errors
///
/// Returns [`HarvestError::Io`] when the write fails.
pub fn write_console(
    settings: &Settings,
    reviews: &[Review],
    now: DateTime<Utc>,
) -> Result<(), HarvestError> {
    let style = settings.format.unwrap_or(OutputFormat::Oneline);
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    format::write_report(&mut handle, reviews, style, settings.show_last_comment, now)
}

/// Email the indented rendering to the configured recipients.
async fn deliver_email(
    settings: &Settings,
    recipients: &[String],
    reviews: &[Review],
    now: DateTime<Utc>,
) -> Result<(), HarvestError> {
    let config = settings
        .mailer
        .clone()
        .ok_or_else(|| HarvestError::Configuration {
            message: String::from(
                "Missing mailer configuration. Check demos/sampleinput_email.toml for correct configuration.",
            ),
        })?;
    let body = format::email_body(reviews, settings.show_last_comment, now);
    Mailer::new(config)
        .send(recipients, &settings.subject, &body)
        .await
}

/// Announce one line per review on the configured channels.
async fn deliver_irc(
    settings: &Settings,
    channels: &[String],
    reviews: &[Review],
    now: DateTime<Utc>,
) -> Result<(), HarvestError> {
    let endpoint = settings
        .irc_endpoint
        .clone()
        .ok_or_else(|| HarvestError::Configuration {
            message: String::from(
                "Missing irc configuration. Check demos/sampleinput_irc.toml for correct configuration.",
            ),
        })?;
    let mut sink = IrcSink::connect(&endpoint, channels.to_vec()).await?;
    sink.deliver(&format::irc_lines(reviews, now)).await?;
    sink.quit().await
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests panic on failure"
)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn email_sink_requires_its_configuration() {
        let settings = Settings {
            email: Some(vec![String::from("one@example.com")]),
            ..Settings::default()
        };

        let error = deliver(&settings, &[], Utc::now())
            .await
            .expect_err("missing mailer table should fail");
        assert_eq!(
            error,
            HarvestError::Configuration {
                message: String::from(
                    "Missing mailer configuration. Check demos/sampleinput_email.toml for correct configuration.",
                ),
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn email_wins_over_irc_when_both_are_selected() {
        let settings = Settings {
            email: Some(vec![String::from("one@example.com")]),
            irc: Some(vec![String::from("#reviews")]),
            ..Settings::default()
        };

        let error = deliver(&settings, &[], Utc::now())
            .await
            .expect_err("missing mailer table should fail");
        assert!(matches!(
            error,
            HarvestError::Configuration { message } if message.contains("mailer")
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn irc_sink_requires_its_configuration() {
        let settings = Settings {
            irc: Some(vec![String::from("#reviews")]),
            ..Settings::default()
        };

        let error = deliver(&settings, &[], Utc::now())
            .await
            .expect_err("missing irc table should fail");
        assert_eq!(
            error,
            HarvestError::Configuration {
                message: String::from(
                    "Missing irc configuration. Check demos/sampleinput_irc.toml for correct configuration.",
                ),
            }
        );
    }
}
