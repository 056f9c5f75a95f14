//! Apple Push Notification service bridge.
//!
//! A single worker task owns the gateway connection. Devices arrive over a
//! channel, frames go out over TLS, and the connection is kept warm for a few
//! seconds between notifications. Failures back off for a second before the
//! next dial so a flapping gateway is not hammered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::config::ApnsConfig;
use crate::storage::PushDevice;

pub const DEFAULT_GATEWAY: &str = "gateway.push.apple.com:2195";

const DEVICE_QUEUE: usize = 64;
const REUSE_WINDOW: Duration = Duration::from_secs(5);
const FAILURE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ApnsHandle {
    tx: mpsc::Sender<Vec<PushDevice>>,
    pub topic: String,
}

impl ApnsHandle {
    /// Non-blocking; notifications are dropped when the worker is saturated
    /// or shutting down.
    pub fn dispatch(&self, devices: Vec<PushDevice>) {
        if let Err(e) = self.tx.try_send(devices) {
            tracing::debug!(error = %e, "apns.drop");
        }
    }
}

/// Binary gateway frame: command 0x00, token length 0x0020, the 32-byte
/// token, then a length-prefixed JSON payload.
pub fn encode_frame(token: &[u8; 32], account_id: &str) -> Vec<u8> {
    let payload = serde_json::json!({ "aps": { "account-id": account_id } }).to_string();
    let mut frame = Vec::with_capacity(37 + payload.len());
    frame.push(0x00);
    frame.extend_from_slice(&0x0020u16.to_be_bytes());
    frame.extend_from_slice(token);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    frame
}

pub fn decode_token(hex_token: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_token.trim()).ok()?;
    <[u8; 32]>::try_from(bytes.as_slice()).ok()
}

/// The push topic advertised to clients: the subject UID attribute
/// (0.9.2342.19200300.100.1.1) of the gateway client certificate, falling
/// back to the common name.
pub fn topic_from_cert(pem_bytes: &[u8]) -> Option<String> {
    let pem = x509_parser::pem::Pem::iter_from_buffer(pem_bytes)
        .next()?
        .ok()?;
    let cert = pem.parse_x509().ok()?;
    for attr in cert.subject().iter_attributes() {
        if attr.attr_type().to_id_string() == "0.9.2342.19200300.100.1.1" {
            if let Ok(v) = attr.as_str() {
                return Some(v.to_string());
            }
        }
    }
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());
    common_name
}

pub fn spawn(config: &ApnsConfig) -> Result<ApnsHandle> {
    let cert_pem = std::fs::read(&config.cert_file)
        .with_context(|| format!("reading {}", config.cert_file.display()))?;
    let key_pem = std::fs::read(&config.key_file)
        .with_context(|| format!("reading {}", config.key_file.display()))?;
    let topic =
        topic_from_cert(&cert_pem).ok_or_else(|| anyhow!("no UID or CN in APNs certificate"))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .context("parsing APNs certificate")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parsing APNs key")?
        .ok_or_else(|| anyhow!("no private key in APNs key file"))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in
        rustls_native_certs::load_native_certs().context("loading system root certificates")?
    {
        let _ = roots.add(cert);
    }
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("building APNs TLS config")?;

    let gateway = config
        .gateway
        .clone()
        .unwrap_or_else(|| DEFAULT_GATEWAY.to_string());
    let host = gateway
        .rsplit_once(':')
        .map(|(h, _)| h.to_string())
        .unwrap_or_else(|| gateway.clone());

    let (tx, rx) = mpsc::channel(DEVICE_QUEUE);
    tokio::spawn(run(rx, TlsConnector::from(Arc::new(tls)), gateway, host));
    tracing::info!(topic = %topic, "apns.start");
    Ok(ApnsHandle { tx, topic })
}

async fn run(
    mut rx: mpsc::Receiver<Vec<PushDevice>>,
    connector: TlsConnector,
    gateway: String,
    host: String,
) {
    let mut conn: Option<tokio_rustls::client::TlsStream<TcpStream>> = None;
    loop {
        let devices = if conn.is_some() {
            match tokio::time::timeout(REUSE_WINDOW, rx.recv()).await {
                Ok(Some(d)) => d,
                Ok(None) => return,
                Err(_) => {
                    // Idle too long; let the gateway connection go.
                    conn = None;
                    continue;
                }
            }
        } else {
            match rx.recv().await {
                Some(d) => d,
                None => return,
            }
        };

        for device in devices {
            let token = match decode_token(&device.token) {
                Some(t) => t,
                None => {
                    tracing::warn!(token = %device.token, "apns.bad_token");
                    continue;
                }
            };
            let frame = encode_frame(&token, &device.account_id);
            if conn.is_none() {
                conn = match dial(&connector, &gateway, &host).await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        tracing::warn!(error = %e, "apns.dial");
                        tokio::time::sleep(FAILURE_PAUSE).await;
                        continue;
                    }
                };
            }
            if let Some(c) = conn.as_mut() {
                let sent = async { c.write_all(&frame).await?; c.flush().await }.await;
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "apns.write");
                    conn = None;
                    tokio::time::sleep(FAILURE_PAUSE).await;
                }
            }
        }
    }
}

async fn dial(
    connector: &TlsConnector,
    gateway: &str,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(gateway).await?;
    let name = rustls::pki_types::ServerName::try_from(host.to_string())?;
    let tls = connector.connect(name, tcp).await?;
    tracing::debug!(gateway = %gateway, "apns.connect");
    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let token = [0xabu8; 32];
        let frame = encode_frame(&token, "6F75E7AC");
        assert_eq!(frame[0], 0x00);
        assert_eq!(&frame[1..3], &[0x00, 0x20]);
        assert_eq!(&frame[3..35], &token);
        let json_len = u16::from_be_bytes([frame[35], frame[36]]) as usize;
        assert_eq!(frame.len(), 37 + json_len);
        let payload: serde_json::Value = serde_json::from_slice(&frame[37..]).unwrap();
        assert_eq!(payload["aps"]["account-id"], "6F75E7AC");
    }

    #[test]
    fn token_decoding() {
        let hex64 = "ab".repeat(32);
        assert_eq!(decode_token(&hex64), Some([0xab; 32]));
        assert_eq!(decode_token("abcd"), None);
        assert_eq!(decode_token("zz"), None);
    }
}
