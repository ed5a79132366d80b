//! Integration test for smtp imposters.

use rift_imposter::config::EngineConfig;
use rift_imposter::imposter::{ImposterConfig, ImposterManager, Protocol};
use rift_imposter::ledger::Outcome;
use rift_imposter::message::Request;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_smtp_messages_are_recorded() {
    let manager = ImposterManager::new(EngineConfig {
        host: "127.0.0.1".to_string(),
        ..Default::default()
    })
    .unwrap();
    let port = manager
        .create_imposter(ImposterConfig::new(Protocol::Smtp))
        .await
        .unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let greeting = lines.next_line().await.unwrap().unwrap();
    assert!(greeting.starts_with("220"));

    let dialogue = [
        ("HELO client.test", "250"),
        ("MAIL FROM:<sender@example.com>", "250"),
        ("RCPT TO:<first@example.com>", "250"),
        ("RCPT TO:<second@example.com>", "250"),
        ("DATA", "354"),
    ];
    for (command, expected) in dialogue {
        write_half
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.starts_with(expected), "{command}: {reply}");
    }

    write_half
        .write_all(b"From: Sender <sender@example.com>\r\nTo: first@example.com\r\nSubject: Status\r\n\r\nAll good.\r\n.\r\n")
        .await
        .unwrap();
    assert!(lines.next_line().await.unwrap().unwrap().starts_with("250"));

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    assert!(lines.next_line().await.unwrap().unwrap().starts_with("221"));

    let requests = manager.requests(port).unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].outcome, Outcome::Accepted);
    let Request::Smtp(mail) = &requests[0].request else {
        panic!("expected smtp request");
    };
    assert_eq!(mail.envelope_from, "sender@example.com");
    assert_eq!(mail.envelope_to, ["first@example.com", "second@example.com"]);
    assert_eq!(mail.subject.as_deref(), Some("Status"));
    assert_eq!(mail.text, "All good.");
    manager.shutdown().await;
}
