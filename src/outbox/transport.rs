//! Outbox transport backends.
//!
//! A transport takes one outbox item and either delivers it or reports a
//! failure for the delivery worker to reschedule. Two backends are
//! supported, selected by configuration rather than per item: a
//! transactional-email HTTP API (Resend-style bearer-auth JSON POST) and an
//! authenticated SMTP session over a plain TCP connection.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::OutboxItem;
use crate::error::TransportError;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Delivery backend contract.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, item: &OutboxItem) -> Result<(), TransportError>;
}

/// Transactional-email HTTP API backend.
pub struct ResendTransport {
    client: reqwest::Client,
    api_key: String,
    from_address: String,
}

impl ResendTransport {
    pub fn new(api_key: String, from_address: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            from_address,
        }
    }
}

#[async_trait]
impl Transport for ResendTransport {
    async fn deliver(&self, item: &OutboxItem) -> Result<(), TransportError> {
        let mut payload = serde_json::json!({
            "from": self.from_address,
            "to": item.to,
            "subject": item.subject,
            "text": item.body,
        });
        if let Some(html) = &item.html {
            payload["html"] = serde_json::Value::String(html.clone());
        }

        let response = self
            .client
            .post(RESEND_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(item_id = %item.id, "Delivered via HTTP API");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Authenticated SMTP session backend.
///
/// Speaks a minimal client-side session: greeting, EHLO, AUTH LOGIN,
/// MAIL FROM / RCPT TO / DATA, QUIT. Reply codes are checked at every step.
pub struct SmtpTransport {
    host: String,
    port: u16,
    username: String,
    password: String,
    from_address: String,
    /// Hostname announced in EHLO. Identifies this client, not the peer.
    ehlo_hostname: String,
}

impl SmtpTransport {
    pub fn new(
        host: String,
        port: u16,
        username: String,
        password: String,
        from_address: String,
        ehlo_hostname: String,
    ) -> Self {
        Self {
            host,
            port,
            username,
            password,
            from_address,
            ehlo_hostname,
        }
    }

    /// Read one (possibly multi-line) SMTP reply and return its code.
    async fn read_reply(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    ) -> Result<u16, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::Smtp(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(TransportError::Smtp("connection closed".to_string()));
            }
            let (code, last) = parse_reply_line(line.trim_end())?;
            if last {
                return Ok(code);
            }
        }
    }

    async fn send_line(
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        line: &str,
    ) -> Result<(), TransportError> {
        writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| TransportError::Smtp(format!("write failed: {}", e)))
    }

    async fn command(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        line: &str,
        expected: u16,
    ) -> Result<(), TransportError> {
        Self::send_line(writer, line).await?;
        let code = Self::read_reply(reader).await?;
        if code != expected {
            return Err(TransportError::Smtp(format!(
                "unexpected reply {} to {}",
                code,
                line.split_whitespace().next().unwrap_or(line)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn deliver(&self, item: &OutboxItem) -> Result<(), TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::Smtp(format!("connect failed: {}", e)))?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let greeting = Self::read_reply(&mut reader).await?;
        if greeting != 220 {
            return Err(TransportError::Smtp(format!("unexpected greeting {}", greeting)));
        }

        Self::command(
            &mut reader,
            &mut writer,
            &format!("EHLO {}", self.ehlo_hostname),
            250,
        )
        .await?;

        Self::command(&mut reader, &mut writer, "AUTH LOGIN", 334).await?;
        Self::command(&mut reader, &mut writer, &BASE64.encode(&self.username), 334).await?;
        Self::command(&mut reader, &mut writer, &BASE64.encode(&self.password), 235).await?;

        Self::command(
            &mut reader,
            &mut writer,
            &format!("MAIL FROM:<{}>", sanitize_header_value(&self.from_address)),
            250,
        )
        .await?;
        for recipient in &item.to {
            Self::command(
                &mut reader,
                &mut writer,
                &format!("RCPT TO:<{}>", sanitize_header_value(recipient)),
                250,
            )
            .await?;
        }

        Self::command(&mut reader, &mut writer, "DATA", 354).await?;
        Self::send_line(&mut writer, &format_message(&self.from_address, item)).await?;
        let code = Self::read_reply(&mut reader).await?;
        if code != 250 {
            return Err(TransportError::Rejected {
                status: code,
                body: "message rejected after DATA".to_string(),
            });
        }

        // Best-effort goodbye; the message is already accepted.
        let _ = Self::send_line(&mut writer, "QUIT").await;

        tracing::debug!(item_id = %item.id, "Delivered via SMTP session");
        Ok(())
    }
}

/// Parse one SMTP reply line into (code, is-last-line).
fn parse_reply_line(line: &str) -> Result<(u16, bool), TransportError> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(|b| b.is_ascii_digit()) {
        return Err(TransportError::Smtp(format!("malformed reply: {:?}", line)));
    }
    let code = (bytes[0] - b'0') as u16 * 100 + (bytes[1] - b'0') as u16 * 10
        + (bytes[2] - b'0') as u16;
    // "250-..." marks a continuation line, "250 ..." (or bare "250") the last.
    let last = bytes.get(3) != Some(&b'-');
    Ok((code, last))
}

/// Neutralize CR/LF in values interpolated into SMTP commands and headers.
/// Both are line-delimited, so an embedded newline in a caller-supplied
/// subject or address would forge extra protocol lines.
fn sanitize_header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Render headers + body as SMTP DATA content, dot-stuffed, terminated with
/// the lone-dot line.
fn format_message(from_address: &str, item: &OutboxItem) -> String {
    let recipients: Vec<String> = item.to.iter().map(|r| sanitize_header_value(r)).collect();

    let mut message = String::new();
    message.push_str(&format!("From: {}\r\n", sanitize_header_value(from_address)));
    message.push_str(&format!("To: {}\r\n", recipients.join(", ")));
    message.push_str(&format!("Subject: {}\r\n", sanitize_header_value(&item.subject)));
    if item.html.is_some() {
        message.push_str("Content-Type: text/html; charset=utf-8\r\n");
    } else {
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    }
    message.push_str("\r\n");

    let body = item.html.as_deref().unwrap_or(&item.body);
    for line in body.lines() {
        if line.starts_with('.') {
            message.push('.');
        }
        message.push_str(line);
        message.push_str("\r\n");
    }
    message.push('.');
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> OutboxItem {
        OutboxItem::new(
            vec!["a@example.com".to_string(), "b@example.com".to_string()],
            "Hello".to_string(),
            "line one\n.starts with dot\nline three".to_string(),
            None,
        )
    }

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("220 smtp.example.com ready").unwrap(), (220, true));
        assert_eq!(parse_reply_line("250-PIPELINING").unwrap(), (250, false));
        assert_eq!(parse_reply_line("250 OK").unwrap(), (250, true));
        assert_eq!(parse_reply_line("250").unwrap(), (250, true));
        assert!(parse_reply_line("xx").is_err());
        assert!(parse_reply_line("abc OK").is_err());
    }

    #[test]
    fn test_format_message_headers_and_dot_stuffing() {
        let message = format_message("companion@example.com", &item());

        assert!(message.starts_with("From: companion@example.com\r\n"));
        assert!(message.contains("To: a@example.com, b@example.com\r\n"));
        assert!(message.contains("Subject: Hello\r\n"));
        assert!(message.contains("Content-Type: text/plain"));
        // Leading dot doubled inside the body, single terminating dot.
        assert!(message.contains("\r\n..starts with dot\r\n"));
        assert!(message.ends_with("\r\n."));
    }

    #[test]
    fn test_header_values_cannot_forge_extra_lines() {
        let mut it = item();
        it.subject = "Hello\r\nBcc: attacker@evil.example".to_string();
        it.to = vec!["victim@example.com\r\nRCPT TO:<attacker@evil.example>".to_string()];

        let message = format_message("companion@example.com", &it);

        assert!(!message.contains("\r\nBcc:"));
        assert!(!message.contains("\r\nRCPT TO:"));
        assert!(message.contains("Subject: Hello  Bcc: attacker@evil.example\r\n"));

        // Every header line before the blank separator is one we emitted.
        let headers = message.split("\r\n\r\n").next().unwrap();
        for line in headers.split("\r\n") {
            assert!(
                line.starts_with("From: ")
                    || line.starts_with("To: ")
                    || line.starts_with("Subject: ")
                    || line.starts_with("Content-Type: "),
                "unexpected header line: {:?}",
                line
            );
        }

        assert_eq!(
            sanitize_header_value("a@example.com\r\nDATA"),
            "a@example.com  DATA"
        );
    }

    #[test]
    fn test_ehlo_announces_client_hostname() {
        let transport = SmtpTransport::new(
            "smtp.example.com".to_string(),
            587,
            "user".to_string(),
            "pass".to_string(),
            "companion@example.com".to_string(),
            "client.internal".to_string(),
        );
        assert_eq!(transport.ehlo_hostname, "client.internal");
        assert_ne!(transport.ehlo_hostname, transport.host);
    }

    #[test]
    fn test_format_message_prefers_html() {
        let mut it = item();
        it.html = Some("<p>hi</p>".to_string());
        let message = format_message("companion@example.com", &it);
        assert!(message.contains("Content-Type: text/html"));
        assert!(message.contains("<p>hi</p>\r\n"));
    }
}
