//! Configuration file loading and CLI/file merging
//!
//! Precedence: command-line flags (and their `TETHER_*` env vars) override
//! values from the YAML file, which override built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_agent::AgentConfig;
use tether_control::{ControlConfig, PortRange, PublicListenerConfig};
use tether_transport::ServerVerification;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_CERT_PATH: &str = "./localhost.pem";
pub const DEFAULT_KEY_PATH: &str = "./localhost-key.pem";

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_allowed_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

/// Relay flags as parsed from the command line
#[derive(Debug, Default, Clone)]
pub struct RelayOverrides {
    pub listen: Option<String>,
    pub public_host: Option<String>,
    pub bind_ip: Option<String>,
    pub port_range: Option<String>,
    pub max_allowed_port: Option<u16>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub max_waiting: Option<usize>,
    pub max_wait_secs: Option<u64>,
    pub plain: bool,
    pub self_signed: bool,
}

/// Agent flags as parsed from the command line
#[derive(Debug, Default, Clone)]
pub struct AgentOverrides {
    pub relay: Option<String>,
    pub target: Option<String>,
    pub server_name: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub insecure: bool,
    pub plain: bool,
    pub skip_probe: bool,
}

/// How the relay secures control connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTls {
    Plain,
    SelfSigned,
    Files { cert: PathBuf, key: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    pub control: ControlConfig,
    pub tls: RelayTls,
}

/// How the agent reaches the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTransport {
    Plain,
    Tls(ServerVerification),
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent: AgentConfig,
    pub transport: AgentTransport,
    pub probe_target: bool,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge relay flags with the config file, giving precedence to flags
pub fn build_relay_settings(args: RelayOverrides, file: RelaySection) -> Result<RelaySettings> {
    let listen = args
        .listen
        .or(file.listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", listen))?;

    let mut control = ControlConfig::default();

    if let Some(host) = args.public_host.or(file.public_host) {
        if host.is_empty() {
            anyhow::bail!("Public host cannot be empty");
        }
        control.public_host = host;
    }

    if let Some(ip) = args.bind_ip.or(file.bind_ip) {
        control.bind_ip = ip
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid bind IP: {}", ip))?;
    }

    if let Some(range) = args.port_range.or(file.port_range) {
        control.port_range = PortRange::parse(&range)?;
    }
    let max_allowed_port = args
        .max_allowed_port
        .or(file.max_allowed_port)
        .unwrap_or(u16::MAX);
    control
        .port_range
        .validate(listen.port(), max_allowed_port)
        .context("Invalid public port range")?;

    let mut listener = PublicListenerConfig::default();
    if let Some(max_waiting) = args.max_waiting.or(file.max_waiting) {
        listener.max_waiting = max_waiting;
    }
    if let Some(secs) = args.max_wait_secs.or(file.max_wait_secs) {
        listener.max_wait = Duration::from_secs(secs);
    }
    control.listener = listener;

    let tls = if args.plain {
        RelayTls::Plain
    } else if args.self_signed {
        RelayTls::SelfSigned
    } else {
        RelayTls::Files {
            cert: args
                .cert
                .or(file.cert)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_PATH)),
            key: args
                .key
                .or(file.key)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_PATH)),
        }
    };

    Ok(RelaySettings {
        listen,
        control,
        tls,
    })
}

/// Merge agent flags with the config file, giving precedence to flags
pub fn build_agent_settings(args: AgentOverrides, file: AgentSection) -> Result<AgentSettings> {
    let relay = args
        .relay
        .or(file.relay)
        .ok_or_else(|| anyhow::anyhow!("Relay address is required (use --relay or config file)"))?;
    let target = args.target.or(file.target).ok_or_else(|| {
        anyhow::anyhow!("Target address is required (use --target or config file)")
    })?;

    validate_address(&relay, "relay")?;
    validate_address(&target, "target")?;

    let server_name = match args.server_name.or(file.server_name) {
        Some(name) => name,
        None => host_of(&relay).to_string(),
    };

    let transport = if args.plain {
        AgentTransport::Plain
    } else if args.insecure {
        AgentTransport::Tls(ServerVerification::Insecure)
    } else if let Some(ca) = args.ca_cert.or(file.ca_cert) {
        AgentTransport::Tls(ServerVerification::CaFile(ca))
    } else {
        AgentTransport::Tls(ServerVerification::WebPki)
    };

    let mut agent = AgentConfig::new(relay, target);
    agent.server_name = server_name;

    Ok(AgentSettings {
        agent,
        transport,
        probe_target: !args.skip_probe,
    })
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("relay.example.com:8080", "relay").is_ok());
        assert!(validate_address("localhost:3000", "target").is_ok());
        assert!(validate_address("[::1]:3000", "target").is_ok());

        assert!(validate_address("relay.example.com", "relay").is_err());
        assert!(validate_address("relay.example.com:", "relay").is_err());
        assert!(validate_address("relay.example.com:abc", "relay").is_err());
        assert!(validate_address(":8080", "relay").is_err());
        assert!(validate_address("", "target").is_err());
    }

    #[test]
    fn test_relay_defaults() {
        let settings =
            build_relay_settings(RelayOverrides::default(), RelaySection::default()).unwrap();
        assert_eq!(settings.listen, DEFAULT_LISTEN.parse().unwrap());
        assert_eq!(settings.control.public_host, "localhost");
        assert_eq!(settings.control.port_range, PortRange::default());
        assert_eq!(
            settings.tls,
            RelayTls::Files {
                cert: PathBuf::from(DEFAULT_CERT_PATH),
                key: PathBuf::from(DEFAULT_KEY_PATH),
            }
        );
    }

    #[test]
    fn test_relay_flags_override_file() {
        let file = RelaySection {
            listen: Some("0.0.0.0:9000".to_string()),
            public_host: Some("relay.example.com".to_string()),
            port_range: Some("61000-61099".to_string()),
            ..Default::default()
        };
        let args = RelayOverrides {
            listen: Some("127.0.0.1:9100".to_string()),
            plain: true,
            ..Default::default()
        };

        let settings = build_relay_settings(args, file).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(settings.control.public_host, "relay.example.com");
        assert_eq!(settings.control.port_range.start(), 61000);
        assert_eq!(settings.tls, RelayTls::Plain);
    }

    #[test]
    fn test_relay_rejects_range_with_control_port() {
        let args = RelayOverrides {
            listen: Some("0.0.0.0:60500".to_string()),
            ..Default::default()
        };
        assert!(build_relay_settings(args, RelaySection::default()).is_err());
    }

    #[test]
    fn test_relay_rejects_range_above_max_allowed() {
        let args = RelayOverrides {
            max_allowed_port: Some(60100),
            ..Default::default()
        };
        assert!(build_relay_settings(args, RelaySection::default()).is_err());
    }

    #[test]
    fn test_agent_requires_relay_and_target() {
        assert!(build_agent_settings(AgentOverrides::default(), AgentSection::default()).is_err());

        let args = AgentOverrides {
            relay: Some("relay.example.com:8080".to_string()),
            ..Default::default()
        };
        assert!(build_agent_settings(args, AgentSection::default()).is_err());
    }

    #[test]
    fn test_agent_settings() {
        let args = AgentOverrides {
            relay: Some("relay.example.com:8080".to_string()),
            target: Some("127.0.0.1:3000".to_string()),
            ..Default::default()
        };

        let settings = build_agent_settings(args, AgentSection::default()).unwrap();
        assert_eq!(settings.agent.server_name, "relay.example.com");
        assert_eq!(settings.agent.target_address, "127.0.0.1:3000");
        assert_eq!(
            settings.transport,
            AgentTransport::Tls(ServerVerification::WebPki)
        );
        assert!(settings.probe_target);
    }

    #[test]
    fn test_agent_insecure_and_plain() {
        let base = AgentOverrides {
            relay: Some("localhost:8080".to_string()),
            target: Some("localhost:3000".to_string()),
            ..Default::default()
        };

        let insecure = AgentOverrides {
            insecure: true,
            ..base.clone()
        };
        assert_eq!(
            build_agent_settings(insecure, AgentSection::default())
                .unwrap()
                .transport,
            AgentTransport::Tls(ServerVerification::Insecure)
        );

        let plain = AgentOverrides {
            plain: true,
            ..base
        };
        assert_eq!(
            build_agent_settings(plain, AgentSection::default())
                .unwrap()
                .transport,
            AgentTransport::Plain
        );
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
relay:
  listen: "0.0.0.0:9443"
  port_range: "62000-62010"
  max_waiting: 4
agent:
  relay: "relay.example.com:9443"
  target: "127.0.0.1:5432"
  ca_cert: "/etc/tether/ca.pem"
"#
        )
        .unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.relay.listen.as_deref(), Some("0.0.0.0:9443"));
        assert_eq!(config.relay.max_waiting, Some(4));

        let agent = build_agent_settings(AgentOverrides::default(), config.agent).unwrap();
        assert_eq!(agent.agent.relay_addr, "relay.example.com:9443");
        assert_eq!(
            agent.transport,
            AgentTransport::Tls(ServerVerification::CaFile(PathBuf::from(
                "/etc/tether/ca.pem"
            )))
        );

        let relay = build_relay_settings(RelayOverrides::default(), config.relay).unwrap();
        assert_eq!(relay.control.listener.max_waiting, 4);
        assert_eq!(relay.control.port_range.port_count(), 11);
    }

    #[test]
    fn test_load_invalid_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "relay: [not, a, mapping]").unwrap();
        assert!(load_config_file(file.path()).is_err());
    }
}
