//! The IMAP protocol engine: accept loop, per-connection sessions, the
//! scanner/lexer/parser stack, response formatting and the update fan-out.

pub mod apns;
pub mod capability;
pub mod command;
pub mod flow;
pub mod lexer;
pub mod mail_view;
pub mod notify;
pub mod parser;
pub mod response;
pub mod session;
pub mod source;
pub mod types;
pub mod utf7;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::ImapConfig;
use crate::storage::Store;
use capability::ServerCapability;
use notify::Notifier;
use session::{Reader, Session, Writer};

pub struct Server {
    bind_addr: SocketAddr,
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    caps: ServerCapability,
    tls: Option<TlsAcceptor>,
    max_conns: usize,
    string_max: usize,
    literal_max: usize,
}

pub fn new(
    config: &ImapConfig,
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    tls: Option<TlsAcceptor>,
) -> Server {
    Server {
        bind_addr: config.bind_addr,
        store,
        caps: ServerCapability::new(notifier.apns.is_some()),
        notifier,
        tls,
        max_conns: config.max_conns,
        string_max: config.max_string_octets,
        literal_max: config.max_append_octets,
    }
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("IMAP server listening on {}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            // Admission: hold off accepting until a session ends.
            if connections.len() >= self.max_conns {
                tokio::select! {
                    _ = connections.next() => (),
                    _ = must_exit.changed() => (),
                }
                continue;
            }
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::debug!("IMAP: accepted connection from {}", remote_addr);

            let conn = tokio::spawn(handle_connection(
                socket,
                self.tls.clone(),
                self.store.clone(),
                self.notifier.clone(),
                self.caps.clone(),
                self.string_max,
                self.literal_max,
            ));
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("IMAP server shutting down, draining remaining sessions...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

async fn handle_connection(
    socket: TcpStream,
    tls: Option<TlsAcceptor>,
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    caps: ServerCapability,
    string_max: usize,
    literal_max: usize,
) {
    let (reader, writer): (Reader, Writer) = match tls {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(stream) => {
                let (r, w) = tokio::io::split(stream);
                (Box::new(r), Box::new(w))
            }
            Err(e) => {
                tracing::debug!(error = %e, "tls.handshake");
                return;
            }
        },
        None => {
            let (r, w) = tokio::io::split(socket);
            (Box::new(r), Box::new(w))
        }
    };
    Session::new(
        reader,
        writer,
        store,
        notifier,
        caps,
        string_max,
        literal_max,
    )
    .run()
    .await;
}
