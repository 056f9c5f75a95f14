//! Server assembly: store, notifier, APNs bridge and TLS glued to the IMAP
//! engine.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::{Config, TlsConfig};
use crate::imap;
use crate::imap::apns;
use crate::imap::notify::{Notifier, UserRegistry};
use crate::storage::in_memory::MemStore;
use crate::storage::Store;

pub struct Server {
    imap: imap::Server,
    pub store: Arc<MemStore>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let store = MemStore::new();
        for user in &config.users {
            store.add_user(&user.name, &user.password);
        }

        let apns = match &config.apns {
            Some(apns_config) => Some(apns::spawn(apns_config).context("starting APNs bridge")?),
            None => None,
        };
        let registry = UserRegistry::new();
        let notifier = Notifier::new(registry, apns);
        store.register_notifier(notifier.clone());

        let tls = config
            .imap
            .tls
            .as_ref()
            .map(build_acceptor)
            .transpose()
            .context("loading TLS material")?;

        let imap = imap::new(
            &config.imap,
            store.clone() as Arc<dyn Store>,
            notifier,
            tls,
        );
        Ok(Self { imap, store })
    }

    pub async fn run(self, must_exit: watch::Receiver<bool>) -> Result<()> {
        self.imap.run(must_exit).await
    }
}

fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&tls.cert_file)
        .with_context(|| format!("reading {}", tls.cert_file.display()))?;
    let key_pem = std::fs::read(&tls.key_file)
        .with_context(|| format!("reading {}", tls.key_file.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .context("parsing certificate")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parsing key")?
        .ok_or_else(|| anyhow!("no private key in {}", tls.key_file.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
