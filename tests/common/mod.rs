#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use postillon::config::{Config, ImapConfig, UserEntry};
use postillon::server::Server;
use postillon::storage::in_memory::MemStore;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemStore>,
    exit: watch::Sender<bool>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.exit.send(true);
    }
}

/// Boot an in-process server on a loopback port with the in-memory store
/// and one account (alice / hunter2).
pub async fn start_server() -> Result<TestServer> {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").context("probing for a free port")?;
    let addr = probe.local_addr()?;
    drop(probe);

    let config = Config {
        imap: ImapConfig {
            bind_addr: addr,
            tls: None,
            max_conns: 64,
            max_string_octets: 1024,
            max_append_octets: 1 << 20,
        },
        users: vec![UserEntry {
            name: "alice".to_string(),
            password: "hunter2".to_string(),
        }],
        apns: None,
    };
    let server = Server::new(config)?;
    let store = server.store.clone();
    let (exit, exit_rx) = watch::channel(false);
    tokio::spawn(server.run(exit_rx));

    let mut last_err = None;
    for _ in 0..100 {
        match TcpStream::connect(addr).await {
            Ok(_) => return Ok(TestServer { addr, store, exit }),
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("server did not come up: {:?}", last_err)
}

pub async fn send(imap: &mut TcpStream, line: &str) -> Result<()> {
    imap.write_all(line.as_bytes()).await.context("write")
}

/// Read until the buffer contains `marker` and ends on a line boundary.
pub async fn read_until(imap: &mut TcpStream, marker: &str) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        {
            let text = String::from_utf8_lossy(&buf);
            if text.contains(marker) && text.ends_with("\r\n") {
                return Ok(text.into_owned());
            }
        }
        let n = tokio::time::timeout(Duration::from_secs(5), imap.read(&mut chunk))
            .await
            .with_context(|| {
                format!(
                    "timeout waiting for {:?}; got {:?}",
                    marker,
                    String::from_utf8_lossy(&buf)
                )
            })?
            .context("read")?;
        if n == 0 {
            bail!(
                "connection closed waiting for {:?}; got {:?}",
                marker,
                String::from_utf8_lossy(&buf)
            );
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn connect(srv: &TestServer) -> Result<TcpStream> {
    let mut imap = TcpStream::connect(srv.addr).await.context("connect")?;
    let greeting = read_until(&mut imap, "* OK").await?;
    assert!(greeting.starts_with("* OK [CAPABILITY IMAP4rev1"));
    Ok(imap)
}

pub async fn login(imap: &mut TcpStream) -> Result<()> {
    send(imap, "10 LOGIN alice hunter2\r\n").await?;
    let read = read_until(imap, "10 OK").await?;
    assert!(read.contains("10 OK"));
    Ok(())
}

pub async fn select_inbox(imap: &mut TcpStream, tag: &str) -> Result<String> {
    send(imap, &format!("{} SELECT INBOX\r\n", tag)).await?;
    read_until(imap, &format!("{} OK", tag)).await
}

/// A small deliverable message; subject distinguishes fixtures.
pub fn email(subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Bob <bob@example.tld>\r\nTo: alice@example.tld\r\nDate: Mon, 7 Feb 1994 21:52:25 -0800\r\nSubject: {}\r\n\r\n{}\r\n",
        subject, body
    )
    .into_bytes()
}

pub async fn deliver_n(srv: &TestServer, n: usize) -> Result<()> {
    for i in 0..n {
        srv.store
            .deliver(
                "alice",
                "INBOX",
                &email(&format!("message {}", i + 1), "hello there"),
            )
            .await
            .context("deliver")?;
    }
    Ok(())
}
