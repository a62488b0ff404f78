//! Configuration Types

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::Result;

/// Label used for rules that do not name themselves
pub const DEFAULT_LABEL: &str = "Unlabelled";

/// Transport family a rule listens and dials with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    /// `http` and `https` are accepted as aliases and forwarded as plain TCP.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "http" | "https" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            other => Err(anyhow!(
                "unknown forward type '{}', expected one of: tcp, udp, http, https",
                other
            )),
        }
    }
}

/// Forward rule exactly as written in the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawForwardRule {
    pub src: String,
    pub dst: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub silent: bool,
    pub log: Option<String>,
    pub disable: bool,
}

/// Configuration file exactly as written, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawProxyConfig {
    pub forward: Vec<RawForwardRule>,
    pub silent: bool,
    pub disable: bool,
}

/// One validated forwarding directive. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    /// Address to listen on; the host part may be empty
    pub src: String,
    /// Address dialed for every accepted connection
    pub dst: String,
    pub transport: TransportKind,
    pub label: String,
    /// Suppress per-connection log lines
    pub silent: bool,
    /// Tee file for the client-to-destination direction
    pub log: Option<PathBuf>,
    pub disable: bool,
}

impl ForwardRule {
    /// Normalize and validate a raw rule.
    ///
    /// Defaults are applied before validation: `http`/`https` rules without a
    /// source listen on `:80`/`:443`, and an empty label becomes `Unlabelled`.
    pub fn from_raw(raw: RawForwardRule) -> Result<Self> {
        let RawForwardRule {
            mut src,
            dst,
            kind,
            label,
            silent,
            log,
            disable,
        } = raw;

        let declared = kind.trim().to_ascii_lowercase();
        if src.is_empty() {
            match declared.as_str() {
                "http" => src = ":80".to_string(),
                "https" => src = ":443".to_string(),
                _ => {}
            }
        }

        if src == dst {
            bail!(
                "Invalid source, cannot be same as destination (src: {}, dst: {}, type: {})",
                src,
                dst,
                kind
            );
        }

        let transport = declared
            .parse::<TransportKind>()
            .with_context(|| format!("Invalid type for forward (src: {}, dst: {})", src, dst))?;

        split_host_port(&src).with_context(|| format!("Invalid source address '{}'", src))?;
        split_host_port(&dst).with_context(|| format!("Invalid destination address '{}'", dst))?;

        let label = if label.is_empty() {
            DEFAULT_LABEL.to_string()
        } else {
            label
        };

        Ok(Self {
            src,
            dst,
            transport,
            label,
            silent,
            log: log.filter(|path| !path.is_empty()).map(PathBuf::from),
            disable,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.disable
    }
}

/// Validated configuration handed to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub forward: Vec<ForwardRule>,
    /// Suppress all log output process-wide
    pub silent: bool,
    /// Perform no forwarding at all
    pub disable: bool,
}

impl ProxyConfig {
    /// Validate every rule. A single bad rule rejects the whole configuration.
    pub fn from_raw(raw: RawProxyConfig) -> Result<Self> {
        let forward = raw
            .forward
            .into_iter()
            .enumerate()
            .map(|(i, rule)| {
                let label = if rule.label.is_empty() {
                    DEFAULT_LABEL.to_string()
                } else {
                    rule.label.clone()
                };
                ForwardRule::from_raw(rule)
                    .with_context(|| format!("Forward rule {} ({}) is invalid", i, label))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            forward,
            silent: raw.silent,
            disable: raw.disable,
        })
    }

    /// Apply command-line overrides. Flags can only switch a setting on.
    pub fn merge_with_cli_args(&mut self, silent: bool, disable: bool) {
        if silent {
            self.silent = true;
            tracing::debug!("CLI override: output silenced");
        }

        if disable {
            self.disable = true;
            tracing::debug!("CLI override: forwarding disabled");
        }
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &ForwardRule> {
        self.forward.iter().filter(|rule| rule.is_enabled())
    }
}

/// Split `host:port` into its parts.
///
/// The host may be empty (`:8080`) and IPv6 hosts must be bracketed
/// (`[::1]:8080`). The port must be a number in `0..=65535`.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| anyhow!("missing ']' in address '{}'", addr))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in address '{}'", addr))?;
        (&rest[..end], port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port in address '{}'", addr))?;
        if host.contains(':') {
            bail!("too many colons in address '{}'", addr);
        }
        (host, port)
    };

    if host.contains('[') || host.contains(']') {
        bail!("unexpected bracket in address '{}'", addr);
    }

    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port '{}' in address '{}'", port, addr))?;

    Ok((host, port))
}
