use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub imap: ImapConfig,
    /// Accounts for the bundled in-memory store.
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// Configuring this enables the XAPPLEPUSHSERVICE capability.
    pub apns: Option<ApnsConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapConfig {
    pub bind_addr: SocketAddr,
    /// Absent means plaintext; production deployments terminate TLS here.
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Cap for quoted strings and bounded literals.
    #[serde(default = "default_string_max")]
    pub max_string_octets: usize,
    /// Cap for streamed APPEND literals.
    #[serde(default = "default_literal_max")]
    pub max_append_octets: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApnsConfig {
    /// Defaults to the production Apple gateway.
    pub gateway: Option<String>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
}

fn default_max_conns() -> usize {
    4096
}

fn default_string_max() -> usize {
    crate::imap::lexer::DEFAULT_STRING_MAX
}

fn default_literal_max() -> usize {
    crate::imap::lexer::DEFAULT_LITERAL_MAX
}

pub fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [imap]
            bind_addr = "[::1]:1143"

            [[users]]
            name = "alice"
            password = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(config.imap.max_conns, 4096);
        assert!(config.imap.tls.is_none());
        assert!(config.apns.is_none());
        assert_eq!(config.users.len(), 1);
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [imap]
            bind_addr = "0.0.0.0:993"
            max_conns = 128
            max_append_octets = 1048576

            [imap.tls]
            cert_file = "/etc/postillon/cert.pem"
            key_file = "/etc/postillon/key.pem"

            [apns]
            cert_file = "/etc/postillon/apns.pem"
            key_file = "/etc/postillon/apns.key"
            "#,
        )
        .unwrap();
        assert_eq!(config.imap.max_conns, 128);
        assert_eq!(config.imap.max_append_octets, 1 << 20);
        assert!(config.imap.tls.is_some());
        assert!(config.apns.as_ref().unwrap().gateway.is_none());
    }
}
