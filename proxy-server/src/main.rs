mod config;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use clap::Parser;
use config::{cache_dir, config_dir, FileConfig, ServerSection};
use log::{error, info};
use proxy_dispatch::{
    run_bounce_forwarder, run_reload_loop, snapshot_channel, Backends, ConfigSnapshot, Dispatcher,
};
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "rsockd")]
#[command(author = "cgfork")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(next_line_help = true)]
pub struct App {
    /// Increases logging verbosity each use for up to 3 times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Checks the potential errors in the proxy's setup without binding
    /// any listener.
    #[arg(long)]
    health: bool,

    /// Specifies a file to use for configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Specifies a file to use for logging.
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Overrides the rule/listener configuration file's "rules" search
    /// entirely and loads rules from this file instead.
    #[arg(long)]
    rules: Option<PathBuf>,
}

/// Tracks one address-keyed family of listener tasks (plain SOCKS/HTTP
/// listeners, or raw UDP bounce forwarders) and reconciles it against a
/// freshly re-read address list (spec.md §8 "a reload that adds an
/// address causes precisely one new listener; one that removes an
/// address closes precisely one old listener; unchanged addresses
/// retain their socket").
struct ListenerSet {
    handles: HashMap<SocketAddr, JoinHandle<()>>,
}

impl ListenerSet {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Aborts tasks whose address is no longer in `desired`, then spawns
    /// `spawn(addr)` for every address in `desired` this set doesn't
    /// already hold a task for. Addresses present in both sets are left
    /// untouched — same task, same bound socket.
    fn reconcile<F>(&mut self, desired: &[SocketAddr], mut spawn: F)
    where
        F: FnMut(SocketAddr) -> JoinHandle<()>,
    {
        let wanted: HashSet<SocketAddr> = desired.iter().copied().collect();
        self.handles.retain(|addr, handle| {
            if wanted.contains(addr) {
                true
            } else {
                handle.abort();
                info!("reload: closed listener on {}", addr);
                false
            }
        });
        for addr in desired {
            if !self.handles.contains_key(addr) {
                let handle = spawn(*addr);
                info!("reload: opened listener on {}", addr);
                self.handles.insert(*addr, handle);
            }
        }
    }
}

fn parse_addrs(addrs: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    addrs
        .iter()
        .map(|s| s.parse().with_context(|| format!("invalid listen address {:?}", s)))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let app = App::parse();
    let logfile = app.log.clone().unwrap_or_else(|| {
        let cache_dir = cache_dir();
        if !cache_dir.exists() {
            std::fs::create_dir_all(&cache_dir).ok();
        }
        cache_dir.join("rsockd.log")
    });
    let configfile = app.config.clone().unwrap_or_else(|| {
        let config_dir = config_dir();
        if !config_dir.exists() {
            std::fs::create_dir_all(&config_dir).ok();
        }
        config_dir.join("config.toml")
    });

    if app.health {
        println!("Version: {}", &version);
        println!("Config file: {}", configfile.display());
        println!("Log file: {}", logfile.display());
        return Ok(());
    }

    setup_logging(logfile.clone(), app.verbose)?;

    let rules_path = app.rules.clone().unwrap_or_else(|| configfile.clone());
    let user_config = if rules_path.exists() {
        Some(FileConfig::from_path(&rules_path)?)
    } else {
        info!("{} does not exist, using the built-in default ruleset", rules_path.display());
        None
    };
    let server_section: ServerSection = user_config
        .as_ref()
        .map(|c| c.server.clone())
        .unwrap_or_default();

    if let Some(pidfile) = &server_section.pidfile {
        write_pidfile(pidfile)?;
    }

    let loaded = config::load_rules(user_config)?;
    for addr in &loaded.udp_listen_addrs {
        info!("bounce_to client-rule registered UDP destination {}", addr.ip());
    }
    let snapshot = ConfigSnapshot::new(loaded.client, loaded.hostid, loaded.socks, loaded.defaults);
    let (tx, rx) = snapshot_channel(snapshot);

    let dispatcher = Arc::new(Dispatcher::new(rx.clone(), Backends::default()));
    let bounce_backends = Arc::new(Backends::default());

    let tcp_addrs = parse_addrs(&server_section.internal)?;
    let udp_addrs = parse_addrs(&server_section.internal_udp)?;

    let mut tcp_listeners = ListenerSet::new();
    tcp_listeners.reconcile(&tcp_addrs, |addr| {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.serve(addr).await {
                error!("listener {} stopped: {}", addr, e);
            }
        })
    });

    let mut udp_listeners = ListenerSet::new();
    udp_listeners.reconcile(&udp_addrs, |addr| {
        let rx = rx.clone();
        let backends = Arc::clone(&bounce_backends);
        tokio::spawn(async move {
            if let Err(e) = run_bounce_forwarder(
                addr,
                rx,
                backends.access.as_ref(),
                backends.ident.as_ref(),
                backends.source_host.as_ref(),
            )
            .await
            {
                error!("bounce listener {} stopped: {}", addr, e);
            }
        })
    });

    // Shared between `rebuild` and `on_reloaded`: the former re-reads
    // `server.internal`/`server.internal_udp` alongside the rule files,
    // the latter reconciles the listener sets against what it found.
    let pending_addrs: Arc<Mutex<(Vec<SocketAddr>, Vec<SocketAddr>)>> =
        Arc::new(Mutex::new((tcp_addrs, udp_addrs)));

    let rebuild_snapshot = {
        let rules_path = rules_path.clone();
        let pending_addrs = Arc::clone(&pending_addrs);
        move || -> anyhow::Result<ConfigSnapshot> {
            let user_config = if rules_path.exists() {
                Some(FileConfig::from_path(&rules_path)?)
            } else {
                None
            };
            let server_section = user_config
                .as_ref()
                .map(|c| c.server.clone())
                .unwrap_or_default();
            let tcp = parse_addrs(&server_section.internal)?;
            let udp = parse_addrs(&server_section.internal_udp)?;
            *pending_addrs.lock().expect("pending_addrs mutex poisoned") = (tcp, udp);

            let loaded = config::load_rules(user_config)?;
            for addr in &loaded.udp_listen_addrs {
                info!("bounce_to client-rule registered UDP destination {}", addr.ip());
            }
            Ok(ConfigSnapshot::new(loaded.client, loaded.hostid, loaded.socks, loaded.defaults))
        }
    };

    let on_reloaded = {
        let dispatcher = Arc::clone(&dispatcher);
        let bounce_backends = Arc::clone(&bounce_backends);
        let rx_for_bounce = rx.clone();
        move |_snapshot: &ConfigSnapshot| {
            let (tcp, udp) = pending_addrs
                .lock()
                .expect("pending_addrs mutex poisoned")
                .clone();
            tcp_listeners.reconcile(&tcp, |addr| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.serve(addr).await {
                        error!("listener {} stopped: {}", addr, e);
                    }
                })
            });
            udp_listeners.reconcile(&udp, |addr| {
                let rx = rx_for_bounce.clone();
                let backends = Arc::clone(&bounce_backends);
                tokio::spawn(async move {
                    if let Err(e) = run_bounce_forwarder(
                        addr,
                        rx,
                        backends.access.as_ref(),
                        backends.ident.as_ref(),
                        backends.source_host.as_ref(),
                    )
                    .await
                    {
                        error!("bounce listener {} stopped: {}", addr, e);
                    }
                })
            });
        }
    };

    let reload = tokio::spawn(run_reload_loop(
        tx,
        move || {
            rebuild_snapshot().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        },
        on_reloaded,
    ));

    let _ = reload.await;
    Ok(())
}

fn write_pidfile(path: &std::path::Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("writing pidfile {}", path.display()))
}

fn setup_logging(logpath: PathBuf, verbosity: u8) -> anyhow::Result<()> {
    let mut base_config = fern::Dispatch::new();

    base_config = match verbosity {
        0 => base_config.level(log::LevelFilter::Warn),
        1 => base_config.level(log::LevelFilter::Info),
        2 => base_config.level(log::LevelFilter::Debug),
        _3_or_more => base_config.level(log::LevelFilter::Trace),
    };

    let file_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} [{}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(fern::log_file(logpath)?);

    let stderr_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .chain(std::io::stderr());

    base_config
        .chain(file_config)
        .chain(stderr_config)
        .apply()
        .map_err(|e| anyhow!("logger already initialized: {}", e))
}
