//! Tether CLI - expose a private TCP service through a public relay
//!
//! `tether relay` runs the public relay, `tether agent` runs next to the
//! private service, and `tether generate-cert` writes a development
//! certificate for the relay.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{
    build_agent_settings, build_relay_settings, load_config_file, AgentOverrides, AgentTransport,
    ConfigFile, RelayOverrides, RelayTls,
};
use std::path::PathBuf;
use std::sync::Arc;
use tether_agent::{Agent, AgentError, TcpForwarder};
use tether_cert::Certificate;
use tether_control::{ControlHandler, RandomPortAllocator, RelayServer, SessionRegistry};
use tether_transport::{
    PlainAcceptor, TcpConnector, TlsConnector, TlsServerAcceptor, TransportAcceptor,
    TransportConnector,
};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Tether - expose a private TCP service through a public relay
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Tether - expose a private TCP service through a public relay")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "TETHER_LOG_LEVEL")]
    log_level: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. Agents hold a control connection to the listen
address; each agent is given its own public port from the port range.

EXAMPLES:
  # TLS with the certificate in ./localhost.pem and ./localhost-key.pem
  tether relay --listen 0.0.0.0:8080

  # Development: throwaway self-signed certificate
  tether relay --self-signed --port-range 60000-60099

ENVIRONMENT VARIABLES:
  TETHER_LISTEN            Control listen address
  TETHER_PUBLIC_HOST       Host name advertised to agents
  TETHER_PORT_RANGE        Public port range (start-end)
  TETHER_MAX_ALLOWED_PORT  Highest port the range may contain
  TETHER_CERT / TETHER_KEY TLS certificate and key (PEM)
"#)]
    Relay(RelayArgs),

    /// Run an agent next to the private service
    #[command(long_about = r#"
Connect to a relay and forward every public connection it hands over to
the target address.

EXAMPLES:
  tether agent --relay relay.example.com:8080 --target 127.0.0.1:3000

  # Relay using a self-signed certificate
  tether agent --relay localhost:8080 --target 127.0.0.1:3000 --insecure

ENVIRONMENT VARIABLES:
  TETHER_RELAY        Relay control address
  TETHER_TARGET       Local target address (host:port)
  TETHER_SERVER_NAME  Expected name on the relay certificate
  TETHER_CA_CERT      CA certificate (PEM) used to verify the relay
"#)]
    Agent(AgentArgs),

    /// Generate a self-signed certificate for development
    GenerateCert {
        /// Certificate output path
        #[arg(long, default_value = config::DEFAULT_CERT_PATH)]
        cert_out: PathBuf,

        /// Private key output path
        #[arg(long, default_value = config::DEFAULT_KEY_PATH)]
        key_out: PathBuf,

        /// DNS names / IP addresses to include (default: localhost, 127.0.0.1, ::1)
        #[arg(long = "domain")]
        domains: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Control listen address (default 0.0.0.0:8080)
    #[arg(long, env = "TETHER_LISTEN")]
    listen: Option<String>,

    /// Host name put in the public address sent to agents
    #[arg(long, env = "TETHER_PUBLIC_HOST")]
    public_host: Option<String>,

    /// IP address public listeners bind to
    #[arg(long, env = "TETHER_BIND_IP")]
    bind_ip: Option<String>,

    /// Public port range, e.g. 60000-60999
    #[arg(long, env = "TETHER_PORT_RANGE")]
    port_range: Option<String>,

    /// Highest port the public range may contain
    #[arg(long, env = "TETHER_MAX_ALLOWED_PORT")]
    max_allowed_port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long, env = "TETHER_CERT")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "TETHER_KEY")]
    key: Option<PathBuf>,

    /// Public connections allowed to wait while an agent is busy
    #[arg(long)]
    max_waiting: Option<usize>,

    /// Seconds a public connection may wait before it is closed
    #[arg(long)]
    max_wait_secs: Option<u64>,

    /// Accept agents over plain TCP (no TLS)
    #[arg(long, conflicts_with = "self_signed")]
    plain: bool,

    /// Use a freshly generated self-signed certificate
    #[arg(long)]
    self_signed: bool,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay control address (host:port)
    #[arg(long, env = "TETHER_RELAY")]
    relay: Option<String>,

    /// Local target address (host:port)
    #[arg(long, env = "TETHER_TARGET")]
    target: Option<String>,

    /// Name expected on the relay certificate (default: relay host)
    #[arg(long, env = "TETHER_SERVER_NAME")]
    server_name: Option<String>,

    /// CA certificate (PEM) used to verify the relay
    #[arg(long, env = "TETHER_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Connect over plain TCP (no TLS)
    #[arg(long, conflicts_with = "insecure")]
    plain: bool,

    /// Don't check that the target is reachable at startup
    #[arg(long)]
    skip_probe: bool,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Relay(args) => run_relay(args, file).await,
        Commands::Agent(args) => run_agent(args, file).await,
        Commands::GenerateCert {
            cert_out,
            key_out,
            domains,
        } => generate_cert(cert_out, key_out, domains),
    }
}

async fn run_relay(args: RelayArgs, file: ConfigFile) -> Result<()> {
    let overrides = RelayOverrides {
        listen: args.listen,
        public_host: args.public_host,
        bind_ip: args.bind_ip,
        port_range: args.port_range,
        max_allowed_port: args.max_allowed_port,
        cert: args.cert,
        key: args.key,
        max_waiting: args.max_waiting,
        max_wait_secs: args.max_wait_secs,
        plain: args.plain,
        self_signed: args.self_signed,
    };
    let settings =
        build_relay_settings(overrides, file.relay).context("Failed to build relay configuration")?;

    info!("Tether relay {} starting", VERSION);

    let acceptor: Arc<dyn TransportAcceptor> = match &settings.tls {
        RelayTls::Plain => {
            warn!("⚠️  Accepting agents over plain TCP, control traffic is unencrypted");
            Arc::new(PlainAcceptor)
        }
        RelayTls::SelfSigned => {
            warn!("⚠️  Using a self-signed certificate (development only)");
            let cert = tether_cert::generate_self_signed_cert()
                .context("Failed to generate self-signed certificate")?;
            Arc::new(TlsServerAcceptor::new(cert.into_certificate())?)
        }
        RelayTls::Files { cert, key } => {
            let certificate = Certificate::from_pem_files(cert, key).with_context(|| {
                format!(
                    "Failed to load TLS certificate {} / key {} (run `tether generate-cert` or pass --self-signed)",
                    cert.display(),
                    key.display()
                )
            })?;
            Arc::new(TlsServerAcceptor::new(certificate)?)
        }
    };

    let control = settings.control;
    info!(
        "Public ports {} on {} advertised as {}",
        control.port_range, control.bind_ip, control.public_host
    );

    let allocator = Arc::new(RandomPortAllocator::new(control.bind_ip, control.port_range));
    let handler = Arc::new(ControlHandler::new(SessionRegistry::new(), allocator, control));

    let server = RelayServer::bind(settings.listen, acceptor, handler)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", settings.listen))?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await;

    info!("Relay stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs, file: ConfigFile) -> Result<()> {
    let overrides = AgentOverrides {
        relay: args.relay,
        target: args.target,
        server_name: args.server_name,
        ca_cert: args.ca_cert,
        insecure: args.insecure,
        plain: args.plain,
        skip_probe: args.skip_probe,
    };
    let settings =
        build_agent_settings(overrides, file.agent).context("Failed to build agent configuration")?;

    info!("Tether agent {} starting", VERSION);
    info!("Relay: {}", settings.agent.relay_addr);
    info!("Target address: {}", settings.agent.target_address);

    if settings.probe_target {
        TcpForwarder::new(settings.agent.target_address.clone())
            .probe()
            .await
            .context("Target is not accepting connections (use --skip-probe to start anyway)")?;
    }

    let connector: Box<dyn TransportConnector> = match settings.transport {
        AgentTransport::Plain => Box::new(TcpConnector),
        AgentTransport::Tls(verification) => {
            Box::new(TlsConnector::new(&settings.agent.server_name, verification)?)
        }
    };

    let agent = Agent::connect(settings.agent, connector.as_ref())
        .await
        .context("Failed to register with relay")?;
    info!("✅ Public address: {}", agent.public_addr());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = agent.run() => {
            match result {
                Ok(()) => info!("Agent stopped normally"),
                Err(AgentError::ConnectionLost) => {
                    error!("Relay closed the connection");
                    return Err(AgentError::ConnectionLost.into());
                }
                Err(e) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

fn generate_cert(cert_out: PathBuf, key_out: PathBuf, domains: Vec<String>) -> Result<()> {
    let cert = if domains.is_empty() {
        tether_cert::generate_self_signed_cert()
    } else {
        tether_cert::generate_self_signed_cert_with_domains(&domains)
    }
    .context("Failed to generate certificate")?;

    cert.save_to_files(&cert_out, &key_out).with_context(|| {
        format!(
            "Failed to write {} / {}",
            cert_out.display(),
            key_out.display()
        )
    })?;

    println!("Certificate: {}", cert_out.display());
    println!("Private key: {}", key_out.display());
    Ok(())
}
