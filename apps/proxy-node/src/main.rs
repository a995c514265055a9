use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use proxy_exchange::collab::TlsAccept;
use proxy_exchange::{
    spawn_listener, ActivePusher, AddressList, Dispatcher, ExchangeConfig, ExchangeContext, MemoryServices,
    PassivePoller, PollerConfig, ProgramType, ProxyMode, ProxyRecord, PusherConfig, ServerPolicy, SessionConfig,
    SessionRegistry, TransferLimits,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

mod config;
mod telemetry;

use config::{FileSettings, ProxyEntry, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(
    name = "proxy-node",
    author,
    version,
    about = "Server or proxy node exchanging monitoring data over the ZBXD protocol"
)]
struct Cli {
    /// Optional TOML/YAML/JSON settings file; command line options win over it.
    #[arg(long, env = "PROXY_NODE_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Node role: server, proxy-active or proxy-passive.
    #[arg(long, env = "PROXY_NODE_ROLE")]
    role: Option<String>,

    /// Address the trapper listens on.
    #[arg(long, env = "PROXY_NODE_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Comma separated server addresses.
    #[arg(long, env = "PROXY_NODE_SERVERS")]
    servers: Option<String>,

    /// Name this proxy reports to its server.
    #[arg(long, env = "PROXY_NODE_HOSTNAME")]
    hostname: Option<String>,

    #[arg(long, env = "PROXY_NODE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    #[arg(long, env = "PROXY_NODE_MAX_RECV_SIZE")]
    max_recv_size: Option<u64>,

    /// How often a server sends configuration to passive proxies.
    #[arg(long, env = "PROXY_NODE_CONFIG_FREQUENCY_SECS")]
    config_frequency_secs: Option<u64>,

    #[arg(long, env = "PROXY_NODE_DATA_FREQUENCY_SECS")]
    data_frequency_secs: Option<u64>,

    #[arg(long, env = "PROXY_NODE_TASKS_FREQUENCY_SECS")]
    tasks_frequency_secs: Option<u64>,

    /// How often an active proxy pushes data.
    #[arg(long, env = "PROXY_NODE_SENDER_FREQUENCY_SECS")]
    sender_frequency_secs: Option<u64>,

    /// Compress outgoing payloads when the peer supports it.
    #[arg(long, env = "PROXY_NODE_COMPRESS")]
    compress: Option<bool>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "PROXY_NODE_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Debug, Clone)]
struct NodeConfig {
    role: ProgramType,
    listen_addr: SocketAddr,
    servers: Vec<String>,
    hostname: String,
    exchange: ExchangeConfig,
    poller: PollerConfig,
    pusher: PusherConfig,
    sessions: SessionConfig,
    metrics_addr: Option<SocketAddr>,
    proxies: Vec<ProxyRecord>,
}

impl TryFrom<Cli> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let settings = FileSettings::load(cli.config_file.as_deref()).with_context(|| match &cli.config_file {
            Some(path) => format!("failed to load settings from {}", path.display()),
            None => "failed to load settings from environment".to_string(),
        })?;
        NodeConfig::merge(cli, settings)
    }
}

impl NodeConfig {
    fn merge(cli: Cli, settings: FileSettings) -> Result<Self> {
        let raw_role = cli.role.unwrap_or(settings.role);
        let role: ProgramType = raw_role.parse().map_err(|err: String| anyhow!(err))?;

        let listen = cli.listen_addr.unwrap_or(settings.listen_addr);
        let listen_addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address: {listen}"))?;

        let servers: Vec<String> = cli
            .servers
            .unwrap_or(settings.servers)
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();
        let hostname = cli.hostname.unwrap_or(settings.hostname).trim().to_string();
        if role == ProgramType::ProxyActive {
            if servers.is_empty() {
                bail!("an active proxy needs at least one server address");
            }
            if hostname.is_empty() {
                bail!("an active proxy needs a hostname to report to its server");
            }
        }

        let metrics_addr = match cli.metrics_addr.or(settings.metrics_addr) {
            Some(addr) if !addr.trim().is_empty() => Some(
                addr.trim()
                    .parse()
                    .with_context(|| format!("invalid metrics address: {addr}"))?,
            ),
            _ => None,
        };

        let exchange = ExchangeConfig {
            timeout: Duration::from_secs(cli.timeout_secs.unwrap_or(settings.timeout_secs).max(1)),
            limits: TransferLimits {
                max_recv_size: cli.max_recv_size.unwrap_or(settings.max_recv_size),
                ..TransferLimits::default()
            },
            compress: cli.compress.unwrap_or(settings.compress),
            ..ExchangeConfig::default()
        };
        let config_frequency = Duration::from_secs(cli.config_frequency_secs.unwrap_or(settings.config_frequency_secs));
        let poller = PollerConfig {
            config_frequency,
            data_frequency: Duration::from_secs(cli.data_frequency_secs.unwrap_or(settings.data_frequency_secs)),
            tasks_frequency: Duration::from_secs(cli.tasks_frequency_secs.unwrap_or(settings.tasks_frequency_secs)),
        };
        let pusher = PusherConfig {
            data_frequency: Duration::from_secs(cli.sender_frequency_secs.unwrap_or(settings.sender_frequency_secs)),
            config_frequency,
        };
        let sessions = SessionConfig {
            idle_timeout: Duration::from_secs(settings.session_idle_secs),
            ..SessionConfig::default()
        };

        let proxies = settings
            .proxies
            .iter()
            .enumerate()
            .map(|(index, entry)| proxy_record(index as u64 + 1, entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(NodeConfig {
            role,
            listen_addr,
            servers,
            hostname,
            exchange,
            poller,
            pusher,
            sessions,
            metrics_addr,
            proxies,
        })
    }
}

fn proxy_record(proxyid: u64, entry: &ProxyEntry) -> Result<ProxyRecord> {
    let mode = match entry.mode.as_str() {
        "active" => ProxyMode::Active,
        "passive" => ProxyMode::Passive,
        other => bail!("proxy \"{}\" has unknown mode \"{other}\"", entry.name),
    };
    Ok(ProxyRecord {
        proxyid,
        name: entry.name.clone(),
        mode,
        address: entry.address.clone(),
        port: entry.port,
        allowed_addresses: entry.allowed_addresses.clone(),
        tls_accept: TlsAccept::default(),
        tls_issuer: None,
        tls_subject: None,
        psk_identity: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = NodeConfig::try_from(cli)?;
    telemetry::init(config.metrics_addr)?;
    info!(
        role = %config.role,
        listen_addr = %config.listen_addr,
        servers = %config.servers.join(","),
        "starting proxy-node"
    );

    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let memory = MemoryServices::new();
    for proxy in &config.proxies {
        memory.config.add_proxy(proxy.clone());
    }
    let services = if config.role.is_proxy() {
        memory.proxy()
    } else {
        memory.server()
    };

    let sessions = SessionRegistry::new(config.sessions.clone());
    let mut ctx = ExchangeContext::new(config.role, services)
        .with_config(config.exchange.clone())
        .with_sessions(sessions.clone())
        .with_hostname(config.hostname.clone());
    if config.role == ProgramType::ProxyPassive {
        ctx = ctx.with_server_policy(ServerPolicy {
            servers: config.servers.clone(),
            ..ServerPolicy::default()
        });
    }
    let ctx = Arc::new(ctx);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind trapper listener")?;
    let listener_handle = spawn_listener(listener, Arc::new(Dispatcher::new(Arc::clone(&ctx))));
    let recycler_handle = sessions.spawn_recycler();

    let exchange_handle = match config.role {
        ProgramType::Server => Some(PassivePoller::new(Arc::clone(&ctx), config.poller.clone()).spawn()),
        ProgramType::ProxyActive => {
            let addresses = AddressList::parse(&config.servers.join(","), DEFAULT_PORT)
                .context("invalid server address list")?;
            Some(ActivePusher::new(Arc::clone(&ctx), addresses, config.pusher.clone()).spawn())
        }
        ProgramType::ProxyPassive => None,
    };

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    if let Some(handle) = exchange_handle {
        handle.abort();
    }
    recycler_handle.abort();
    listener_handle.abort();
    info!("proxy-node stopped");

    Ok(())
}
