//! Email delivery of the review report.
//!
//! The indented report is embedded into a small HTML document and
//! submitted over plain SMTP, one connection per run. The relay and
//! sender come from the `[mailer]` table.

use minijinja::{Environment, context};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::MailerConfig;
use crate::error::HarvestError;

/// HTML document the report is embedded into.
const BODY_TEMPLATE: &str = "<html><body><pre>{{ report }}</pre></body></html>";

/// Name the client introduces itself with.
const CLIENT_NAME: &str = "localhost";

/// SMTP client for the email sink.
pub struct Mailer {
    config: MailerConfig,
}

impl Mailer {
    /// Create a mailer for the configured relay.
    #[must_use]
    pub const fn new(config: MailerConfig) -> Self {
        Self { config }
    }

    /// Send the report to every recipient in one SMTP session.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Configuration`] when the body cannot be
    /// rendered and [`HarvestError::Io`] when the relay cannot be reached
    /// or rejects a command.
    pub async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        report: &str,
    ) -> Result<(), HarvestError> {
        let body = render_body(report)?;
        let message = build_message(&self.config.sender, recipients, subject, &body);
        self.submit(recipients, &message).await
    }

    /// Drive the SMTP session for one prepared message.
    async fn submit(&self, recipients: &[String], message: &str) -> Result<(), HarvestError> {
        let address = format!("{}:{}", self.config.server, self.config.port);
        tracing::debug!(relay = %address, "connecting to smtp relay");
        let stream = TcpStream::connect(&address).await?;
        let (read_half, mut writer) = stream.into_split();
        let mut replies = BufReader::new(read_half);

        expect_reply(&mut replies, "220").await?;
        send_line(&mut writer, &format!("EHLO {CLIENT_NAME}")).await?;
        expect_reply(&mut replies, "250").await?;
        send_line(&mut writer, &format!("MAIL FROM:<{}>", self.config.sender)).await?;
        expect_reply(&mut replies, "250").await?;
        for recipient in recipients {
            send_line(&mut writer, &format!("RCPT TO:<{recipient}>")).await?;
            expect_reply(&mut replies, "250").await?;
        }
        send_line(&mut writer, "DATA").await?;
        expect_reply(&mut replies, "354").await?;
        writer.write_all(dot_stuffed(message).as_bytes()).await?;
        send_line(&mut writer, ".").await?;
        expect_reply(&mut replies, "250").await?;
        send_line(&mut writer, "QUIT").await?;
        tracing::debug!(recipients = recipients.len(), "report emailed");
        Ok(())
    }
}

/// Render the HTML document carrying the report text.
fn render_body(report: &str) -> Result<String, HarvestError> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| minijinja::AutoEscape::Html);
    env.add_template("email", BODY_TEMPLATE)
        .map_err(|error| HarvestError::Configuration {
            message: format!("invalid email template: {error}"),
        })?;
    let template = env
        .get_template("email")
        .map_err(|error| HarvestError::Configuration {
            message: format!("missing email template: {error}"),
        })?;
    template
        .render(context! { report => report })
        .map_err(|error| HarvestError::Configuration {
            message: format!("email rendering failed: {error}"),
        })
}

/// Assemble the message with its headers and HTML payload.
fn build_message(sender: &str, recipients: &[String], subject: &str, body: &str) -> String {
    format!(
        "From: {sender}\r\nTo: {}\r\nSubject: {subject}\r\nMIME-Version: 1.0\r\n\
         Content-Type: text/html; charset=\"utf-8\"\r\n\r\n{body}",
        recipients.join(", ")
    )
}

/// Normalize line endings to CRLF and escape leading dots.
fn dot_stuffed(message: &str) -> String {
    let mut wire = String::with_capacity(message.len() + 16);
    for line in message.split('\n') {
        let content = line.strip_suffix('\r').unwrap_or(line);
        if content.starts_with('.') {
            wire.push('.');
        }
        wire.push_str(content);
        wire.push_str("\r\n");
    }
    wire
}

/// Read one SMTP reply, tolerating multi-line responses, and check its
/// code.
async fn expect_reply<R>(replies: &mut R, code: &str) -> Result<(), HarvestError>
where
    R: AsyncBufReadExt + Unpin,
{
    loop {
        let mut line = String::new();
        let read = replies.read_line(&mut line).await?;
        if read == 0 {
            return Err(HarvestError::Io {
                message: String::from("smtp relay closed the connection"),
            });
        }
        let reply = line.trim_end();
        tracing::debug!(reply, "smtp reply");
        if !reply.starts_with(code) {
            return Err(HarvestError::Io {
                message: format!("smtp relay answered '{reply}' instead of {code}"),
            });
        }
        let continued = format!("{code}-");
        if !reply.starts_with(&continued) {
            return Ok(());
        }
    }
}

/// Write one CRLF-terminated command.
async fn send_line<W>(writer: &mut W, line: &str) -> Result<(), HarvestError>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests panic on failure"
)]
mod tests {
    use rstest::rstest;
    use tokio::net::TcpListener;

    use super::*;

    async fn local_relay() -> (TcpListener, MailerConfig) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind a local listener");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        let config = MailerConfig {
            server: String::from("127.0.0.1"),
            sender: String::from("reviewbot@example.com"),
            port,
        };
        (listener, config)
    }

    #[rstest]
    fn escapes_the_report_into_html() {
        let body = render_body("alice filed 'fix <thing>'").expect("body should render");
        assert!(body.starts_with("<html><body><pre>"));
        assert!(body.ends_with("</pre></body></html>"));
        assert!(body.contains("&lt;thing&gt;"));
        assert!(!body.contains("<thing>"));
    }

    #[rstest]
    fn message_carries_the_html_headers() {
        let message = build_message(
            "reviewbot@example.com",
            &[
                String::from("one@example.com"),
                String::from("two@example.com"),
            ],
            "review-rot notification",
            "<html></html>",
        );
        assert!(message.starts_with("From: reviewbot@example.com\r\n"));
        assert!(message.contains("To: one@example.com, two@example.com\r\n"));
        assert!(message.contains("Subject: review-rot notification\r\n"));
        assert!(message.contains("Content-Type: text/html; charset=\"utf-8\"\r\n"));
        assert!(message.ends_with("\r\n\r\n<html></html>"));
    }

    #[rstest]
    #[case::stuffs_leading_dots("a\n.b\nc", "a\r\n..b\r\nc\r\n")]
    #[case::normalizes_bare_newlines("one\ntwo", "one\r\ntwo\r\n")]
    #[case::keeps_existing_crlf("one\r\ntwo", "one\r\ntwo\r\n")]
    fn prepares_the_wire_form(#[case] message: &str, #[case] wire: &str) {
        assert_eq!(dot_stuffed(message), wire);
    }

    #[tokio::test]
    async fn submits_the_report_over_smtp() {
        let (listener, config) = local_relay().await;
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut transcript = Vec::new();

            write_half.write_all(b"220 double ready\r\n").await.unwrap();
            transcript.push(lines.next_line().await.unwrap().unwrap());
            write_half
                .write_all(b"250-double\r\n250 OK\r\n")
                .await
                .unwrap();
            for _ in 0..3 {
                transcript.push(lines.next_line().await.unwrap().unwrap());
                write_half.write_all(b"250 OK\r\n").await.unwrap();
            }
            transcript.push(lines.next_line().await.unwrap().unwrap());
            write_half.write_all(b"354 go ahead\r\n").await.unwrap();
            loop {
                let line = lines.next_line().await.unwrap().unwrap();
                if line == "." {
                    break;
                }
                transcript.push(line);
            }
            write_half.write_all(b"250 queued\r\n").await.unwrap();
            transcript.push(lines.next_line().await.unwrap().unwrap());
            transcript
        });

        let mailer = Mailer::new(config);
        mailer
            .send(
                &[
                    String::from("one@example.com"),
                    String::from("two@example.com"),
                ],
                "review-rot notification",
                "alice filed a request\n.dotted <line>",
            )
            .await
            .expect("submission should succeed");

        let transcript = relay.await.unwrap();
        assert_eq!(transcript.first().map(String::as_str), Some("EHLO localhost"));
        assert!(transcript.contains(&String::from("MAIL FROM:<reviewbot@example.com>")));
        assert!(transcript.contains(&String::from("RCPT TO:<one@example.com>")));
        assert!(transcript.contains(&String::from("RCPT TO:<two@example.com>")));
        assert!(transcript.contains(&String::from("DATA")));
        assert!(transcript.contains(&String::from("Subject: review-rot notification")));
        assert!(
            transcript.contains(&String::from("..dotted &lt;line&gt;</pre></body></html>")),
            "body should be dot-stuffed and escaped: {transcript:?}"
        );
        assert_eq!(transcript.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn rejected_sender_surfaces_the_reply() {
        let (listener, config) = local_relay().await;
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            write_half.write_all(b"220 double ready\r\n").await.unwrap();
            lines.next_line().await.unwrap();
            write_half.write_all(b"250 OK\r\n").await.unwrap();
            lines.next_line().await.unwrap();
            write_half
                .write_all(b"550 sender rejected\r\n")
                .await
                .unwrap();
        });

        let mailer = Mailer::new(config);
        let error = mailer
            .send(
                &[String::from("one@example.com")],
                "review-rot notification",
                "report",
            )
            .await
            .expect_err("rejected sender should fail");

        relay.await.unwrap();
        assert_eq!(
            error,
            HarvestError::Io {
                message: String::from("smtp relay answered '550 sender rejected' instead of 250"),
            }
        );
    }
}
