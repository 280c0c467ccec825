//! The mother process (spec.md §4.6-4.7, C7), reworked into a single
//! async task per spec.md §0: instead of a `select()`/`poll()` loop over
//! listening sockets, ack pipes, and child-to-mother pipes, the
//! dispatcher is a handful of concurrently-spawned loops coupled by
//! bounded `mpsc` channels and `StagePool` permits. A connection moving
//! from one stage to the next is this crate's version of "sending an
//! object over a descriptor-passing pipe"; a stage task finishing and
//! dropping its `WorkerSlot` is the free-slot ack.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use proxy_auth::{Authentication, Authenticator};
use proxy_rules::{AccessBackend, IdentClient, NoAccessBackend, NoIdentClient, SourceHostCheck};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::config::ConfigSnapshot;
use crate::pool::{StageKind, StagePool};
use crate::session::{IoRecord, RequestRecord, SessionRecord, SessionState};
use crate::stage::{io_stage, negotiate_stage, request_stage};
use crate::throttle::DeathThrottle;

/// Collaborators the dispatcher threads through to every stage (spec.md
/// §4.4's `AccessBackend`/`IdentClient`/`SourceHostCheck` seams, plus the
/// username/password backend the negotiate stage's SOCKSv5 subnegotiation
/// calls). All default to the permissive/no-op stand-ins when a
/// deployment configures no real backend.
pub struct Backends {
    pub authenticator: Box<dyn Authenticator + Send + Sync>,
    pub access: Box<dyn AccessBackend>,
    pub ident: Box<dyn IdentClient>,
    pub source_host: Box<dyn SourceHostCheck>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            authenticator: Box::new(Authentication::NoAuth),
            access: Box::new(NoAccessBackend),
            ident: Box::new(NoIdentClient),
            source_host: Box::new(proxy_rules::PermissiveSourceHostCheck),
        }
    }
}

/// Owns the three stage pools and the reload channel, and runs the
/// accept loop for one SOCKS listener. A deployment with multiple
/// `internal`/`external` listen addresses (spec.md §3 "Listener") runs
/// one `Dispatcher::serve` per address, sharing the same
/// `watch::Receiver<ConfigSnapshot>` and stage pools.
pub struct Dispatcher {
    negotiate_pool: StagePool,
    request_pool: StagePool,
    io_pool: StagePool,
    config: watch::Receiver<ConfigSnapshot>,
    backends: Arc<Backends>,
}

impl Dispatcher {
    pub fn new(config: watch::Receiver<ConfigSnapshot>, backends: Backends) -> Self {
        let snapshot = config.borrow().clone();
        Self {
            negotiate_pool: StagePool::new(StageKind::Negotiate, snapshot.negotiate_capacity),
            request_pool: StagePool::new(StageKind::Request, snapshot.request_capacity),
            io_pool: StagePool::new(StageKind::Io, snapshot.io_capacity),
            config,
            backends: Arc::new(backends),
        }
    }

    /// Binds `addr` and runs the accept loop until the listener errors
    /// unrecoverably. Each accepted connection is handed to the negotiate
    /// pool; if the pool has no free slot the connection is held for one
    /// retry pass before being dropped, mirroring spec.md §4.6's "saved
    /// object" backpressure behavior rather than blocking the accept loop.
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", addr);

        let mut saved: Option<SessionRecord> = None;
        let mut death_throttle = DeathThrottle::new();

        loop {
            if let Some(record) = saved.take() {
                match self.try_dispatch_negotiate(record) {
                    Ok(()) => {}
                    Err(record) => {
                        saved = Some(record);
                        tokio::task::yield_now().await;
                        continue;
                    }
                }
            }

            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let local = socket.local_addr().unwrap_or(addr);
            let record = SessionRecord::new(socket, peer, local);

            if let Err(record) = self.try_dispatch_negotiate(record) {
                saved = Some(record);
            }

            if death_throttle.is_tripped(Instant::now()) {
                error!("too many worker deaths in the last 10s, backing off accepting");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    fn try_dispatch_negotiate(&self, record: SessionRecord) -> Result<(), SessionRecord> {
        let Some(slot) = self.negotiate_pool.try_claim(false) else {
            return Err(record);
        };

        let snapshot = self.config.borrow().clone();
        let backends = Arc::clone(&self.backends);
        let request_pool = self.request_pool.clone();
        let io_pool = self.io_pool.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let _slot = slot;
            let peer = record.peer;
            match negotiate_stage(
                record,
                &snapshot,
                backends.authenticator.as_ref(),
                backends.access.as_ref(),
                backends.ident.as_ref(),
                backends.source_host.as_ref(),
            )
            .await
            {
                Ok(request_record) => {
                    dispatch_request(request_record, request_pool, io_pool, config, backends).await;
                }
                Err(e) => {
                    debug!("negotiate stage ended for {}: {}", peer, e);
                }
            }
        });

        Ok(())
    }
}

fn dispatch_request(
    record: RequestRecord,
    request_pool: StagePool,
    io_pool: StagePool,
    config: watch::Receiver<ConfigSnapshot>,
    backends: Arc<Backends>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(slot) = request_pool.try_claim(false) else {
            debug!("request pool exhausted, dropping session from {}", record.peer);
            return;
        };
        let _slot = slot;
        debug_assert!(record
            .state
            .can_transition_to(SessionState::Requested));

        let snapshot = config.borrow().clone();
        match request_stage(
            record,
            &snapshot,
            backends.access.as_ref(),
            backends.ident.as_ref(),
            backends.source_host.as_ref(),
        )
        .await
        {
            Ok(io_record) => {
                dispatch_io(io_record, &io_pool, backends);
            }
            Err(e) => {
                debug!("request stage failed: {}", e);
            }
        }
    })
}

fn dispatch_io(record: IoRecord, io_pool: &StagePool, backends: Arc<Backends>) {
    // A UDP-ASSOCIATE session occupies the barefoot-UDP exclusivity slot
    // (spec.md §4.6); a TCP relay does not.
    let needs_udp_exclusivity = record.udp_socket.is_some();
    let Some(slot) = io_pool.try_claim(needs_udp_exclusivity) else {
        warn!("io pool exhausted, closing an already-accepted session");
        return;
    };
    tokio::spawn(async move {
        let _slot = slot;
        match io_stage(
            record,
            backends.access.as_ref(),
            backends.ident.as_ref(),
            backends.source_host.as_ref(),
        )
        .await
        {
            Ok((a_to_b, b_to_a)) => {
                debug!("relay closed, {} bytes up, {} bytes down", a_to_b, b_to_a);
            }
            Err(e) => debug!("relay ended with error: {}", e),
        }
    });
}

/// Installs a SIGHUP handler that rebuilds and republishes the
/// configuration snapshot (spec.md §4.2, §8 scenario E). `rebuild` is the
/// caller-supplied "re-read the on-disk rule files" step; this function
/// owns the signal plumbing and the atomic `watch` publish. `on_reloaded`
/// runs after each successful rebuild, before the new snapshot is
/// published — the caller's hook for anything else a reload should
/// revisit, such as reconciling the listener set against the freshly
/// re-read `server.internal` addresses (spec.md §8 "a reload that adds
/// an address causes precisely one new listener; one that removes an
/// address closes precisely one old listener; unchanged addresses
/// retain their socket").
pub async fn run_reload_loop<F, R>(tx: watch::Sender<ConfigSnapshot>, mut rebuild: F, mut on_reloaded: R)
where
    F: FnMut() -> std::io::Result<ConfigSnapshot>,
    R: FnMut(&ConfigSnapshot),
{
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("unable to install SIGHUP handler: {}", e);
            return;
        }
    };

    loop {
        hangup.recv().await;
        info!("SIGHUP received, reloading configuration");
        match rebuild() {
            Ok(snapshot) => {
                on_reloaded(&snapshot);
                if tx.send(snapshot).is_err() {
                    warn!("no receivers left for configuration reload, stopping reload loop");
                    return;
                }
            }
            Err(e) => error!("configuration reload failed, keeping the old snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_rules::{RuleBase, RuleClass, RuleDefaults};

    fn empty_snapshot() -> ConfigSnapshot {
        ConfigSnapshot::new(
            RuleBase::new(RuleClass::Client),
            RuleBase::new(RuleClass::Hostid),
            RuleBase::new(RuleClass::Socks),
            RuleDefaults::default(),
        )
    }

    #[tokio::test]
    async fn dispatcher_accepts_a_connection_and_claims_a_negotiate_slot() {
        let (_tx, rx) = watch::channel(empty_snapshot());
        let dispatcher = Dispatcher::new(rx, Backends::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let serve = tokio::spawn(async move {
            let _ = dispatcher.serve(addr).await;
        });

        // Give the accept loop a moment to bind, then connect and let the
        // negotiate stage fail fast (no valid SOCKS handshake bytes sent).
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        serve.abort();
    }
}
