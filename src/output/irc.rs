//! IRC delivery of the review report.
//!
//! One short-lived connection per run: register and join the configured
//! channels, answer the server's first PING, push one PRIVMSG per report
//! line with a pause between sends, then sign off and drain.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::IrcConfig;
use crate::error::HarvestError;

/// Nick the reporter registers under.
const NICK: &str = "review_rot_bot";

/// Timeout applied to each socket operation.
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte limit for one command and its parameters.
const MAX_COMMAND_BYTES: usize = 510;

/// Pause between messages so the channels are not flooded.
const SEND_PAUSE: Duration = Duration::from_millis(500);

/// Short-lived IRC connection delivering one report.
#[derive(Debug)]
pub struct IrcSink {
    stream: TcpStream,
    channels: Vec<String>,
}

impl IrcSink {
    /// Connect, register, and join every configured channel.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Io`] when the server cannot be reached or
    /// rejects a registration command within the timeout.
    pub async fn connect(
        endpoint: &IrcConfig,
        channels: Vec<String>,
    ) -> Result<Self, HarvestError> {
        tracing::debug!(server = %endpoint.server, port = endpoint.port, "connecting to irc");
        let address = format!("{}:{}", endpoint.server, endpoint.port);
        let stream = io_step(TcpStream::connect(&address), "irc connect").await?;
        let mut sink = Self { stream, channels };
        sink.register().await?;
        sink.answer_ping().await?;
        tracing::debug!("irc connection ready");
        Ok(sink)
    }

    /// Send each report line to every channel, pausing between messages.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Io`] when a send fails or times out.
    pub async fn deliver(&mut self, lines: &[String]) -> Result<(), HarvestError> {
        for line in lines {
            self.send_message(line).await?;
        }
        Ok(())
    }

    /// Sign off and wait for the server to acknowledge the quit.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Io`] when the connection breaks before the
    /// server finishes.
    pub async fn quit(mut self) -> Result<(), HarvestError> {
        tracing::debug!("closing irc connection");
        send_command(&mut self.stream, "QUIT ").await?;
        let mut buffer = [0_u8; 1024];
        loop {
            let read = io_step(self.stream.read(&mut buffer), "irc drain").await?;
            if read == 0 {
                return Ok(());
            }
        }
    }

    /// Introduce the bot and join each channel.
    async fn register(&mut self) -> Result<(), HarvestError> {
        for channel in &self.channels {
            tracing::debug!(channel, "joining channel");
            send_command(
                &mut self.stream,
                &format!("USER {NICK} {NICK} {NICK} {NICK}"),
            )
            .await?;
            send_command(&mut self.stream, &format!("NICK {NICK}")).await?;
            send_command(&mut self.stream, &format!("JOIN {channel}")).await?;
        }
        Ok(())
    }

    /// Servers ping before accepting traffic; answer the first one.
    async fn answer_ping(&mut self) -> Result<(), HarvestError> {
        let mut buffer = [0_u8; 1024];
        let read = io_step(self.stream.read(&mut buffer), "irc greeting").await?;
        let greeting = String::from_utf8_lossy(buffer.get(..read).unwrap_or_default()).into_owned();
        let mut words = greeting.split_whitespace();
        if words.next() == Some("PING") {
            let token = words.next().unwrap_or_default();
            send_command(&mut self.stream, &format!("PONG {token}")).await?;
        }
        Ok(())
    }

    /// Announce one line on every channel.
    async fn send_message(&mut self, message: &str) -> Result<(), HarvestError> {
        let text: String = message
            .chars()
            .filter(|ch| !matches!(ch, '\n' | '\r'))
            .collect();
        for channel in &self.channels {
            tracing::debug!(channel, "sending report line");
            let command = clamp_command(format!("PRIVMSG {channel} :{text}"));
            send_command(&mut self.stream, &command).await?;
            tokio::time::sleep(SEND_PAUSE).await;
        }
        Ok(())
    }
}

/// Write one CRLF-terminated command under the timeout.
async fn send_command(stream: &mut TcpStream, command: &str) -> Result<(), HarvestError> {
    let wire = format!("{command}\r\n");
    io_step(stream.write_all(wire.as_bytes()), "irc send").await
}

/// Trim a command to the protocol's byte limit on a character boundary.
fn clamp_command(mut command: String) -> String {
    if command.len() > MAX_COMMAND_BYTES {
        let mut cut = MAX_COMMAND_BYTES;
        while !command.is_char_boundary(cut) {
            cut -= 1;
        }
        command.truncate(cut);
    }
    command
}

/// Run one socket operation under the sink's timeout.
async fn io_step<T>(
    operation: impl Future<Output = std::io::Result<T>>,
    context: &str,
) -> Result<T, HarvestError> {
    match tokio::time::timeout(IO_TIMEOUT, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(HarvestError::Io {
            message: format!("{context}: {error}"),
        }),
        Err(_) => Err(HarvestError::Io {
            message: format!("{context}: timed out"),
        }),
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests panic on failure"
)]
mod tests {
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn local_endpoint() -> (TcpListener, IrcConfig) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind a local listener");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        let endpoint = IrcConfig {
            server: String::from("127.0.0.1"),
            port,
        };
        (listener, endpoint)
    }

    async fn read_text(socket: &mut tokio::net::TcpStream, until: &str) -> String {
        let mut received = String::new();
        let mut buffer = [0_u8; 1024];
        while !received.contains(until) {
            let read = socket.read(&mut buffer).await.unwrap();
            assert_ne!(read, 0, "peer closed before '{until}' arrived");
            received.push_str(std::str::from_utf8(buffer.get(..read).unwrap()).unwrap());
        }
        received
    }

    #[tokio::test]
    async fn registers_and_answers_the_first_ping() {
        let (listener, endpoint) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let registration = read_text(&mut socket, "JOIN #reviews\r\n").await;
            socket.write_all(b"PING :12345\r\n").await.unwrap();
            let pong = read_text(&mut socket, "\r\n").await;
            (registration, pong)
        });

        let sink = IrcSink::connect(&endpoint, vec![String::from("#reviews")])
            .await
            .expect("connection should register");
        let (registration, pong) = server.await.unwrap();

        assert!(registration.contains(
            "USER review_rot_bot review_rot_bot review_rot_bot review_rot_bot\r\n"
        ));
        assert!(registration.contains("NICK review_rot_bot\r\n"));
        assert_eq!(pong, "PONG :12345\r\n");
        drop(sink);
    }

    #[tokio::test]
    async fn delivers_stripped_lines_to_every_channel_and_signs_off() {
        let (listener, endpoint) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_text(&mut socket, "JOIN #two\r\n").await;
            socket.write_all(b":server 001 welcome\r\n").await.unwrap();
            read_text(&mut socket, "QUIT \r\n").await
        });

        let mut sink = IrcSink::connect(
            &endpoint,
            vec![String::from("#one"), String::from("#two")],
        )
        .await
        .expect("connection should register");
        sink.deliver(&[String::from("line\nwith\rbreaks")])
            .await
            .expect("delivery should succeed");
        sink.quit().await.expect("quit should drain");

        let received = server.await.unwrap();
        assert!(received.contains("PRIVMSG #one :linewithbreaks\r\n"));
        assert!(received.contains("PRIVMSG #two :linewithbreaks\r\n"));
        assert!(received.ends_with("QUIT \r\n"));
    }

    #[tokio::test]
    async fn unreachable_server_fails_with_io() {
        let (listener, endpoint) = local_endpoint().await;
        drop(listener);

        let error = IrcSink::connect(&endpoint, vec![String::from("#reviews")])
            .await
            .expect_err("closed port should fail");
        assert!(matches!(error, HarvestError::Io { .. }));
    }

    #[rstest]
    fn clamps_commands_to_the_protocol_limit() {
        let short = clamp_command(String::from("PRIVMSG #reviews :ok"));
        assert_eq!(short, "PRIVMSG #reviews :ok");

        let long = clamp_command(format!("PRIVMSG #reviews :{}", "a".repeat(600)));
        assert_eq!(long.len(), MAX_COMMAND_BYTES);

        let accented = clamp_command(format!("PRIVMSG #reviews :{}", "é".repeat(300)));
        assert!(accented.len() <= MAX_COMMAND_BYTES);
        assert!(accented.is_char_boundary(accented.len()));
    }
}
