//! Cluster DNS configuration, detected from the installed runtime-config
//! package.
//!
//! The runtime-config package payload is a (possibly gzipped) tar archive
//! with a `vars.json` member holding planet environment variables. Missing
//! keys fall back to the planet defaults.

use std::io::Read;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::Packages;
use crate::loc::Locator;

pub const DNS_LISTEN_ADDR_VAR: &str = "PLANET_DNS_LISTEN_ADDR";
pub const DNS_PORT_VAR: &str = "PLANET_DNS_PORT";

pub const DEFAULT_DNS_LISTEN_ADDR: &str = "127.0.0.2";
pub const DEFAULT_DNS_PORT: u16 = 53;

const VARS_MEMBER: &str = "vars.json";

/// Address and port the planet DNS resolver listens on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    pub listen_addr: String,
    pub port: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_DNS_LISTEN_ADDR.to_string(),
            port: DEFAULT_DNS_PORT,
        }
    }
}

/// Read the DNS configuration from the installed runtime-config package.
pub async fn dns_config_from_package(
    packages: &dyn Packages,
    config_package: &Locator,
) -> Result<DnsConfig> {
    let (_, payload) = packages
        .read_package(config_package)
        .await
        .with_context(|| format!("failed to read runtime config package {config_package}"))?;

    let Some(vars) = read_member(&payload, VARS_MEMBER)? else {
        warn!(
            "No {} member in {}, using default DNS configuration",
            VARS_MEMBER, config_package
        );
        return Ok(DnsConfig::default());
    };

    let vars: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&vars)
        .with_context(|| format!("failed to parse {VARS_MEMBER} from {config_package}"))?;

    let listen_addr = vars
        .get(DNS_LISTEN_ADDR_VAR)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_DNS_LISTEN_ADDR)
        .to_string();

    let port = match vars.get(DNS_PORT_VAR) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s
            .parse()
            .with_context(|| format!("invalid {DNS_PORT_VAR} value {s:?}"))?,
        Some(serde_json::Value::Number(n)) => u16::try_from(n.as_u64().unwrap_or(0))
            .with_context(|| format!("invalid {DNS_PORT_VAR} value {n}"))?,
        _ => DEFAULT_DNS_PORT,
    };

    Ok(DnsConfig { listen_addr, port })
}

/// Extract a member from a tar (or tar.gz) payload by file name.
fn read_member(payload: &[u8], name: &str) -> Result<Option<Vec<u8>>> {
    if payload.starts_with(&[0x1f, 0x8b]) {
        scan_archive(GzDecoder::new(payload), name)
    } else {
        scan_archive(payload, name)
    }
}

fn scan_archive<R: Read>(reader: R, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("failed to read package archive")? {
        let mut entry = entry.context("failed to read package archive entry")?;
        let matches = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|f| f == name))
            .unwrap_or(false);
        if matches {
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .context("failed to read archive member")?;
            return Ok(Some(content));
        }
    }
    Ok(None)
}
