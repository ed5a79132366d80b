//! SMTP connection handling.
//!
//! A minimal server dialogue: every message delivered with DATA is parsed and
//! recorded in the ledger. SMTP imposters have no stubs and never fail a
//! delivery.

use super::core::Imposter;
use crate::framing::{Boundary, FrameCodec};
use crate::message::{Request, SmtpRequest};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::debug;

/// Envelope and message collected over one transaction.
#[derive(Debug, Default)]
struct Transaction {
    envelope_from: String,
    envelope_to: Vec<String>,
    /// Set while reading DATA lines
    data: Option<Vec<String>>,
}

impl Transaction {
    fn reset(&mut self) {
        *self = Transaction::default();
    }
}

pub(crate) async fn serve_connection(imposter: Arc<Imposter>, stream: TcpStream, peer: SocketAddr) {
    let port = imposter.port();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        FrameCodec::new(Boundary::Delimiter(b"\r\n".to_vec())),
    );

    if write_half
        .write_all(b"220 rift-imposter ESMTP ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    let mut transaction = Transaction::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = imposter.shutdown_token().cancelled() => {
                let _ = write_half.write_all(b"421 Service closing transmission channel\r\n").await;
                break;
            }
            next = lines.next() => next,
        };
        let line = match next {
            Some(Ok(line)) => String::from_utf8_lossy(&line).into_owned(),
            Some(Err(e)) => {
                debug!("SMTP read from {} on port {} failed: {}", peer, port, e);
                break;
            }
            None => break,
        };

        let reply = match handle_line(&mut transaction, &line) {
            Step::Reply(reply) => reply,
            Step::Continue => continue,
            Step::Delivered(message) => {
                let request = message.into_request(peer, &transaction);
                imposter.accept(Request::Smtp(request));
                transaction.reset();
                "250 OK: message accepted"
            }
            Step::Quit => {
                let _ = write_half.write_all(b"221 Bye\r\n").await;
                break;
            }
        };
        if write_half.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

enum Step {
    Reply(&'static str),
    Continue,
    Delivered(Message),
    Quit,
}

fn handle_line(transaction: &mut Transaction, line: &str) -> Step {
    if let Some(data) = transaction.data.as_mut() {
        if line == "." {
            let data = transaction.data.take().unwrap_or_default();
            return Step::Delivered(Message::parse(&data));
        }
        // dot-stuffing
        let line = line.strip_prefix('.').filter(|_| line.starts_with("..")).unwrap_or(line);
        data.push(line.to_string());
        return Step::Continue;
    }

    let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
    match verb.to_ascii_uppercase().as_str() {
        "HELO" | "EHLO" => Step::Reply("250 rift-imposter"),
        "MAIL" => {
            transaction.envelope_from = address(argument, "FROM:");
            Step::Reply("250 OK")
        }
        "RCPT" => {
            transaction.envelope_to.push(address(argument, "TO:"));
            Step::Reply("250 OK")
        }
        "DATA" => {
            transaction.data = Some(Vec::new());
            Step::Reply("354 End data with <CR><LF>.<CR><LF>")
        }
        "RSET" => {
            transaction.reset();
            Step::Reply("250 OK")
        }
        "NOOP" => Step::Reply("250 OK"),
        "QUIT" => Step::Quit,
        _ => Step::Reply("502 Command not implemented"),
    }
}

/// `FROM:<a@b.c> SIZE=10` -> `a@b.c`
fn address(argument: &str, prefix: &str) -> String {
    let argument = argument.trim();
    let rest = match argument.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => argument[prefix.len()..].trim(),
        _ => argument,
    };
    match (rest.find('<'), rest.find('>')) {
        (Some(start), Some(end)) if start < end => rest[start + 1..end].to_string(),
        _ => rest.split_whitespace().next().unwrap_or("").to_string(),
    }
}

/// Headers and body of a delivered message.
#[derive(Debug, Default)]
struct Message {
    from: Option<String>,
    to: Vec<String>,
    subject: Option<String>,
    text: String,
}

impl Message {
    fn parse(lines: &[String]) -> Self {
        let mut message = Message::default();
        let mut body_start = lines.len();
        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                body_start = i + 1;
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "from" => message.from = Some(value.to_string()),
                "to" => message.to.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string),
                ),
                "subject" => message.subject = Some(value.to_string()),
                _ => {}
            }
        }
        message.text = lines.get(body_start..).unwrap_or_default().join("\n");
        message
    }

    fn into_request(self, peer: SocketAddr, transaction: &Transaction) -> SmtpRequest {
        SmtpRequest {
            request_from: peer.to_string(),
            envelope_from: transaction.envelope_from.clone(),
            envelope_to: transaction.envelope_to.clone(),
            from: self.from,
            to: self.to,
            subject: self.subject,
            text: self.text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(transaction: &mut Transaction, lines: &[&str]) -> Option<Message> {
        for line in lines {
            if let Step::Delivered(message) = handle_line(transaction, line) {
                return Some(message);
            }
        }
        None
    }

    #[test]
    fn test_dialogue_delivers_message() {
        let mut transaction = Transaction::default();
        let message = run(
            &mut transaction,
            &[
                "EHLO client",
                "MAIL FROM:<alice@example.com> SIZE=120",
                "RCPT TO:<bob@example.com>",
                "rcpt to: <carol@example.com>",
                "DATA",
                "From: Alice <alice@example.com>",
                "To: bob@example.com, carol@example.com",
                "Subject: Hello",
                "",
                "First line",
                "..leading dot",
                ".",
            ],
        )
        .unwrap();
        assert_eq!(transaction.envelope_from, "alice@example.com");
        assert_eq!(transaction.envelope_to, ["bob@example.com", "carol@example.com"]);
        assert_eq!(message.subject.as_deref(), Some("Hello"));
        assert_eq!(message.to, ["bob@example.com", "carol@example.com"]);
        assert_eq!(message.text, "First line\n.leading dot");
    }

    #[test]
    fn test_unknown_and_quit() {
        let mut transaction = Transaction::default();
        assert!(matches!(handle_line(&mut transaction, "VRFY x"), Step::Reply(r) if r.starts_with("502")));
        assert!(matches!(handle_line(&mut transaction, "quit"), Step::Quit));
    }

    #[test]
    fn test_rset_clears_envelope() {
        let mut transaction = Transaction::default();
        handle_line(&mut transaction, "MAIL FROM:<a@b.c>");
        handle_line(&mut transaction, "RSET");
        assert!(transaction.envelope_from.is_empty());
    }
}
