//! Keel: command-line front end for the tunnel supervisor
//!
//! Loads client settings, wires the collaborators and prints the status
//! feed while a tunnel is up.

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Command, ConnectArgs, LogFormat};
use keel_vpn::{
    AuthGateway, BearerToken, ClientSettings, Collaborators, ConfigurationResolver, ConnectionState, HttpControlPlane,
    HttpDirectory, ServerDirectory, SessionLog, SessionReporter, SessionStore, StaticDirectory, StaticGateway,
    TunnelSupervisor, UdpConnector, recommend,
};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let settings = load_settings(&cli.config)?;

    match cli.command {
        Command::Servers => list_servers(&settings).await,
        Command::Connect(args) => connect(settings, args).await,
        Command::History => history(&settings),
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => subscriber.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Plain => subscriber
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .init(),
    }
}

fn load_settings(path: &Path) -> Result<ClientSettings> {
    if !path.exists() {
        info!("No settings at {}, using defaults", path.display());
        return Ok(ClientSettings::default());
    }
    ClientSettings::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Collaborators shared by every command
struct Wiring {
    control: Arc<HttpControlPlane>,
    auth: Arc<dyn AuthGateway>,
    directory: Arc<dyn ServerDirectory>,
}

impl Wiring {
    fn new(settings: &ClientSettings) -> Result<Self> {
        let control = Arc::new(HttpControlPlane::new(&settings.control_url)?);

        // an empty token makes the gateway report "not signed in"
        let token = settings.token.clone().unwrap_or_default();
        let auth: Arc<dyn AuthGateway> = Arc::new(StaticGateway::new(
            settings.user_id.clone(),
            BearerToken::valid_for(token, settings.token_ttl()),
            settings.token_ttl(),
        ));

        let directory: Arc<dyn ServerDirectory> = if settings.remote_directory {
            Arc::new(HttpDirectory::new(control.clone(), auth.clone()))
        } else {
            Arc::new(StaticDirectory::new(settings.servers.clone())?)
        };

        Ok(Self {
            control,
            auth,
            directory,
        })
    }
}

async fn list_servers(settings: &ClientSettings) -> Result<()> {
    let wiring = Wiring::new(settings)?;
    let servers = wiring.directory.list_servers().await?;
    if servers.is_empty() {
        println!("No servers configured");
        return Ok(());
    }

    let best = recommend(&servers, settings.allow_premium).map(|s| s.id.clone());
    for server in &servers {
        let mark = if best.as_deref() == Some(server.id.as_str()) { "*" } else { " " };
        println!(
            "{} {:<16} {:<24} {:>4}ms {:>3}% {}{}",
            mark,
            server.id,
            server.name,
            server.latency_ms,
            server.load,
            server.endpoint,
            if server.premium { " (premium)" } else { "" }
        );
    }
    Ok(())
}

async fn connect(settings: ClientSettings, args: ConnectArgs) -> Result<()> {
    if settings.token.is_none() {
        bail!("settings have no `token`; sign in and add one");
    }
    let wiring = Wiring::new(&settings)?;

    let server_id = match args.server_id {
        Some(id) => id,
        None => {
            let servers = wiring.directory.list_servers().await?;
            recommend(&servers, settings.allow_premium)
                .map(|s| s.id.clone())
                .context("no server given and none available")?
        }
    };

    let resolver = ConfigurationResolver::new(wiring.control.clone())
        .with_retry(settings.retry_policy())
        .with_request_timeout(settings.resolve_timeout())
        .with_routing(settings.routing.clone())
        .with_fallback_dns(settings.dns.clone());

    let reporter = settings
        .report_sessions
        .then(|| wiring.control.clone() as Arc<dyn SessionReporter>);
    let sessions = match &settings.session_log {
        Some(path) => SessionStore::with_log(SessionLog::new(path)),
        None => SessionStore::new(),
    };

    let supervisor = TunnelSupervisor::new(
        Collaborators {
            auth: wiring.auth,
            directory: wiring.directory,
            resolver,
            connector: Arc::new(UdpConnector::new()),
            reporter,
        },
        sessions,
        settings.timings(),
    );

    let mut events = supervisor.subscribe();
    supervisor.connect(&server_id).await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, disconnecting");
                supervisor.shutdown().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    match &event.reason {
                        Some(reason) => println!("[{}] {} ({})", event.sequence, event.state, reason),
                        None => println!("[{}] {}", event.sequence, event.state),
                    }
                    if let ConnectionState::Failed(reason) = event.state {
                        supervisor.acknowledge().await;
                        bail!("connection failed: {}", reason);
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} status events", missed),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn history(settings: &ClientSettings) -> Result<()> {
    let path = settings
        .session_log
        .as_ref()
        .context("settings have no `session_log`")?;
    let sessions = SessionLog::new(path).load()?;

    if sessions.is_empty() {
        println!("No sessions recorded");
    }
    for session in sessions {
        let started = session
            .started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        println!(
            "{} {:<16} started={} duration={}s bytes={} {:?}",
            session.id,
            session.server_id,
            started,
            session.duration().as_secs(),
            session.bytes_transferred,
            session.status
        );
    }
    Ok(())
}
