// NANDA Linux agent: registry discovery, liveness, peer directory and tunnel relay daemon.

mod agent;
mod config;
mod device;
mod dispatch;
mod hwaddr;
mod http;
mod locator;
mod mdns;
mod peers;
mod registration;
mod registry;
mod status;
mod store;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nanda_core::{DeviceIdentity, DeviceRouter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::{Agent, AgentParts};
use crate::dispatch::SharedExecutor;
use crate::store::FileEndpointStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    version: bool,
    config: Option<PathBuf>,
    set_registry: Option<String>,
    clear_registry: bool,
    print_identity: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut out = Args::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" | "-c" => {
                let p = it.next().ok_or("--config needs a path")?;
                out.config = Some(PathBuf::from(p));
            }
            "--set-registry" => {
                let u = it.next().ok_or("--set-registry needs a URL")?;
                out.set_registry = Some(u);
            }
            "--clear-registry" => out.clear_registry = true,
            "--print-identity" => out.print_identity = true,
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1)).map_err(anyhow::Error::msg)?;
    if args.version {
        println!("nanda-linux {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(args.config.as_deref())?;

    let store = FileEndpointStore::new(cfg.state_file());
    if let Some(url) = args.set_registry.as_deref() {
        store.save(url)?;
        println!("registry set to {} ({})", url.trim(), store.path().display());
        return Ok(());
    }
    if args.clear_registry {
        store.clear()?;
        println!("registry cleared ({})", store.path().display());
        return Ok(());
    }

    let mac = hwaddr::resolve(cfg.mac.as_deref());
    let identity = DeviceIdentity::from_hardware_address(&mac);
    if args.print_identity {
        println!("{}", serde_json::to_string_pretty(&identity)?);
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(run(cfg, identity, store))
}

async fn run(cfg: config::Config, identity: DeviceIdentity, store: FileEndpointStore) -> anyhow::Result<()> {
    info!(handle = %identity.handle(), id = %identity.full_id(), version = VERSION, "starting");
    let agent_url = agent::advertise_url(&cfg);
    let executor: SharedExecutor = Arc::new(DeviceRouter::new(
        identity.clone(),
        agent_url.clone(),
        VERSION,
        device::SimulatedDevice::new(),
    ));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.http_port))
        .await
        .with_context(|| format!("bind http port {}", cfg.http_port))?;
    let http_task = tokio::spawn(http::serve(listener, executor.clone(), cfg.executor_timeout()));

    let mdns_daemon = if cfg.enable_mdns {
        match mdns_sd::ServiceDaemon::new() {
            Ok(d) => {
                if let Err(e) = mdns::advertise(&d, &identity, cfg.http_port, VERSION) {
                    warn!(error = %e, "mdns advertisement failed");
                }
                Some(d)
            }
            Err(e) => {
                warn!(error = %e, "mdns unavailable");
                None
            }
        }
    } else {
        None
    };

    let agent = Agent::new(AgentParts {
        gateway: locator::resolve_gateway(cfg.gateway),
        identity,
        agent_url,
        store: Arc::new(store),
        browser: mdns_daemon.clone().map(mdns::MdnsBrowser::new),
        executor,
        config: cfg,
    })?;

    let tasks = tokio::select! {
        state = agent.startup() => {
            info!(
                handle = %agent.identity().handle(),
                ?state,
                standalone = agent.status().is_standalone(),
                peers = agent.peers().len(),
                "startup complete"
            );
            let mut tasks = agent.start();
            let (trigger_tx, trigger_rx) = mpsc::channel(1);
            tasks.push(agent.listen_for_retriggers(trigger_rx));
            tasks.push(forward_retrigger_signal(trigger_tx)?);
            tasks
        }
        r = shutdown_signal() => {
            http_task.abort();
            return r;
        }
    };

    shutdown_signal().await?;
    info!("shutting down");
    for t in tasks {
        t.abort();
    }
    http_task.abort();
    if let Some(d) = mdns_daemon {
        let _ = d.shutdown();
    }
    Ok(())
}

/// SIGUSR1 asks for a manual refresh; signals arriving while one is pending are merged.
#[cfg(unix)]
fn forward_retrigger_signal(tx: mpsc::Sender<()>) -> anyhow::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut usr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    Ok(tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            match tx.try_send(()) {
                Ok(()) => info!("manual refresh requested"),
                Err(mpsc::error::TrySendError::Full(())) => debug!("manual refresh already pending"),
                Err(mpsc::error::TrySendError::Closed(())) => break,
            }
        }
    }))
}

#[cfg(not(unix))]
fn forward_retrigger_signal(tx: mpsc::Sender<()>) -> anyhow::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move { tx.closed().await }))
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit; systemd may restart if configured.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
