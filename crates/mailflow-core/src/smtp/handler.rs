//! SMTP session handler

use anyhow::Result;
use mailflow_common::config::SmtpConfig;
use mailflow_common::types::{EmailAddress, Envelope};
use mailflow_pipeline::{Mail, PipelineHandle};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// SMTP session handler
pub struct SmtpHandler {
    config: SmtpConfig,
    hostname: String,
    pipeline: PipelineHandle,
    peer_addr: SocketAddr,
}

impl SmtpHandler {
    /// Create a new handler for one accepted connection
    pub fn new(
        config: SmtpConfig,
        hostname: String,
        pipeline: PipelineHandle,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            config,
            hostname,
            pipeline,
            peer_addr,
        }
    }

    /// Handle an SMTP session
    pub async fn handle(self, stream: TcpStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Connected;
        let mut envelope = Envelope::empty(Some(self.peer_addr.ip().to_string()));

        self.send_response(&mut writer, 220, &format!("{} ESMTP Mailflow", self.hostname))
            .await?;

        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                debug!("Client {} disconnected", self.peer_addr);
                break;
            }

            let line = line.trim();
            debug!("SMTP from {}: {}", self.peer_addr, line);

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    envelope.helo = Some(args.to_string());
                    state = SessionState::Greeted;
                    self.send_response(&mut writer, 250, &format!("Hello {}", args))
                        .await?;
                }

                "EHLO" => {
                    envelope.helo = Some(args.to_string());
                    state = SessionState::Greeted;

                    let responses = [
                        format!("{} Hello {}", self.hostname, args),
                        format!("SIZE {}", self.config.max_message_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if let Some(from_addr) = parse_mail_from(args) {
                        envelope.from = from_addr;
                        state = SessionState::MailFrom;
                        self.send_response(&mut writer, 250, "2.1.0 OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "5.1.7 Bad sender address syntax")
                            .await?;
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if envelope.to.len() >= self.config.max_recipients {
                        self.send_response(&mut writer, 452, "4.5.3 Too many recipients")
                            .await?;
                        continue;
                    }

                    if let Some(to_addr) = parse_rcpt_to(args) {
                        if !envelope.to.contains(&to_addr) {
                            envelope.to.push(to_addr);
                        }
                        state = SessionState::RcptTo;
                        self.send_response(&mut writer, 250, "2.1.5 OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "5.1.3 Bad recipient address syntax")
                            .await?;
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if envelope.to.is_empty() {
                        self.send_response(&mut writer, 503, "5.5.1 No recipients specified")
                            .await?;
                        continue;
                    }

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    match self.read_data(&mut reader).await {
                        Ok(data) => match self.submit_message(&envelope, data) {
                            Ok(name) => {
                                info!(
                                    "Message {} accepted from {} for {} recipient(s)",
                                    name,
                                    self.peer_addr,
                                    envelope.to.len()
                                );
                                self.send_response(
                                    &mut writer,
                                    250,
                                    &format!("2.0.0 OK: queued as {}", name),
                                )
                                .await?;
                            }
                            Err(e) => {
                                warn!("Failed to enqueue message: {}", e);
                                self.send_response(&mut writer, 451, "4.3.0 Temporary error")
                                    .await?;
                            }
                        },
                        Err(e) => {
                            warn!("Failed to read message data: {}", e);
                            self.send_response(&mut writer, 451, "4.3.0 Error reading message")
                                .await?;
                        }
                    }

                    state = SessionState::Greeted;
                    envelope.reset();
                }

                "RSET" => {
                    envelope.reset();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "2.0.0 Bye").await?;
                    break;
                }

                "VRFY" => {
                    self.send_response(&mut writer, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }

                "EXPN" => {
                    self.send_response(&mut writer, 502, "5.5.1 EXPN not supported")
                        .await?;
                }

                _ => {
                    self.send_response(&mut writer, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Read message data until <CRLF>.<CRLF>
    async fn read_data<R: tokio::io::AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut line = String::new();
        let max_size = self.config.max_message_size;

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                return Err(anyhow::anyhow!("Connection closed during DATA"));
            }

            if line.trim_end_matches(['\r', '\n']) == "." {
                break;
            }

            // Dot-stuffing: drop the escape dot
            let line_bytes = if line.starts_with("..") {
                &line.as_bytes()[1..]
            } else {
                line.as_bytes()
            };

            data.extend_from_slice(line_bytes);

            if data.len() > max_size {
                return Err(anyhow::anyhow!("Message too large"));
            }
        }

        Ok(data)
    }

    /// Build the mail object and hand it to the pipeline at the root stage
    fn submit_message(&self, envelope: &Envelope, data: Vec<u8>) -> Result<String> {
        let mail = Mail::new(envelope.from.clone(), envelope.to.clone(), data)
            .with_client_ip(envelope.client_ip.clone());
        let name = mail.name().to_string();

        self.pipeline
            .submit(mail, Mail::DEFAULT)
            .map_err(|e| anyhow::anyhow!("pipeline submission failed: {}", e))?;

        Ok(name)
    }

    /// Send an SMTP response
    async fn send_response<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    let parts: Vec<&str> = line.splitn(2, ' ').collect();
    (parts.first().unwrap_or(&""), parts.get(1).unwrap_or(&""))
}

/// Parse MAIL FROM:<address> or MAIL FROM: <address>
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let args = args.trim();

    let addr_part = if args.to_uppercase().starts_with("FROM:") {
        &args[5..]
    } else {
        return None;
    };

    let addr_part = addr_part.trim();

    // Null sender <>
    if addr_part == "<>" {
        return Some(None);
    }

    let email = if addr_part.starts_with('<') && addr_part.contains('>') {
        let end = addr_part.find('>')?;
        &addr_part[1..end]
    } else {
        addr_part.split_whitespace().next()?
    };

    if email.is_empty() {
        Some(None)
    } else {
        Some(EmailAddress::parse(email))
    }
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let args = args.trim();

    let addr_part = if args.to_uppercase().starts_with("TO:") {
        &args[3..]
    } else {
        return None;
    };

    let addr_part = addr_part.trim();

    let email = if addr_part.starts_with('<') && addr_part.contains('>') {
        let end = addr_part.find('>')?;
        &addr_part[1..end]
    } else {
        addr_part.split_whitespace().next()?
    };

    EmailAddress::parse(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("EHLO client.test"), ("EHLO", "client.test"));
        assert_eq!(parse_command("QUIT"), ("QUIT", ""));
        assert_eq!(
            parse_command("MAIL FROM:<a@b.test>"),
            ("MAIL", "FROM:<a@b.test>")
        );
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );

        assert_eq!(
            parse_mail_from("FROM: <user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );

        assert_eq!(parse_mail_from("FROM:<>"), Some(None));

        assert_eq!(parse_mail_from("invalid"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );

        assert_eq!(
            parse_rcpt_to("TO: <user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );

        assert_eq!(parse_rcpt_to("TO:<>"), None);
    }

    #[tokio::test]
    async fn test_read_data_unstuffs_dots() {
        use tokio::sync::mpsc;

        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = SmtpHandler::new(
            SmtpConfig::default(),
            "mx.test".to_string(),
            PipelineHandle::from_sender(tx),
            "127.0.0.1:2525".parse().unwrap(),
        );

        let input = b"line one\r\n..stuffed\r\n.\r\nignored\r\n";
        let mut reader = BufReader::new(&input[..]);
        let data = handler.read_data(&mut reader).await.unwrap();

        assert_eq!(data, b"line one\r\n.stuffed\r\n");
    }

    #[tokio::test]
    async fn test_read_data_enforces_size_cap() {
        use tokio::sync::mpsc;

        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SmtpConfig {
            max_message_size: 16,
            ..SmtpConfig::default()
        };
        let handler = SmtpHandler::new(
            config,
            "mx.test".to_string(),
            PipelineHandle::from_sender(tx),
            "127.0.0.1:2525".parse().unwrap(),
        );

        let input = b"this line alone is much longer than sixteen bytes\r\n.\r\n";
        let mut reader = BufReader::new(&input[..]);
        assert!(handler.read_data(&mut reader).await.is_err());
    }
}
