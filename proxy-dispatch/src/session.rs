//! Per-client session state machine (spec.md §4.5, C5).
//!
//! ```text
//! ACCEPTED ──► NEGOTIATING ──► REQUESTED ──► RELAYING ──► CLOSED
//!     │            │               │             │
//!     └────────────┴───────────────┴─────────────┴──► FAILED
//! ```
//!
//! A transition happens only when the dispatcher successfully hands the
//! record off to the next stage pool (spec.md "Transitions occur when the
//! dispatcher successfully hands off to the next worker pool"). The HTTP
//! proxy-auth re-queue edge (spec.md §9 open question) is modeled as
//! `Relaying -> Negotiating { renegotiation: true }`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use proxy_auth::AuthState;
use proxy_io::TargetAddr;
use proxy_rules::{Command, ConnectionState, RuleBase, RuleDefaults, Version};
use tokio::net::TcpStream;

/// The session's current stage. `Closed`/`Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Negotiating { renegotiation: bool },
    Requested,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self -> next` is a transition the state machine allows.
    /// Invalid transitions are a programming error in the dispatcher, not
    /// a runtime condition callers need to recover from, so this is used
    /// in `debug_assert!` at call sites rather than returning a `Result`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, Negotiating { .. })
                | (Negotiating { .. }, Requested)
                | (Requested, Relaying)
                | (Relaying, Closed)
                // spec.md §9 open question: HTTP re-auth keeps the
                // connection alive for a fresh CONNECT instead of dropping.
                | (Relaying, Negotiating { renegotiation: true })
                | (Accepted, Failed)
                | (Negotiating { .. }, Failed)
                | (Requested, Failed)
                | (Relaying, Failed)
        )
    }
}

/// Dispatcher-owned record from `accept()` until the negotiate stage
/// claims it (spec.md §3 "SessionRecord", §6 "client_object").
pub struct SessionRecord {
    pub socket: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub accepted_at: Instant,
    pub state: SessionState,
}

impl SessionRecord {
    pub fn new(socket: TcpStream, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            local,
            accepted_at: Instant::now(),
            state: SessionState::Accepted,
        }
    }
}

/// Produced by the negotiate stage, consumed by the request stage
/// (spec.md §6 "request_object"). `auth` is the method the negotiate
/// stage's client-rule lookup already settled on; the request stage's
/// socks-rule lookup may upgrade it further.
pub struct RequestRecord {
    pub socket: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub auth: AuthState,
    pub version: Version,
    /// SOCKSv4(a) folds the command+target into the same message as the
    /// (implicit) method negotiation, so by the time the negotiate stage
    /// can tell the client even has a method, it has already read the
    /// request too; SOCKSv5 only reads candidate methods at this point
    /// and leaves the request for the request stage to read separately.
    pub pending: PendingRequest,
    pub state: SessionState,
}

#[derive(Debug, Clone)]
pub enum PendingRequest {
    AlreadyParsed {
        command: Command,
        target: TargetAddr,
    },
    ReadFromSocketV5,
}

/// Produced by the request stage, consumed by the IO stage (spec.md §6
/// "io_object"). `src`/`dst` are the two relay descriptors; for a
/// `UdpAssociate` session `dst` is unused and `udp_socket` carries the
/// bound UDP socket instead.
pub struct IoRecord {
    pub src: TcpStream,
    pub dst: Option<TcpStream>,
    pub udp_socket: Option<tokio::net::UdpSocket>,
    pub udp_client: Option<SocketAddr>,
    pub connection: ConnectionState,
    pub matched_rule: usize,
    pub log_flags: proxy_rules::LogFlags,
    pub timeouts: proxy_rules::Timeouts,
    pub state: SessionState,
    /// The session's peer address, its current auth state, and the
    /// socks-rule base/defaults it was matched against — carried through
    /// so a `UdpAssociate` session can re-run the rule check per datagram
    /// in the IO stage instead of only once at ACCEPT time (spec.md §4.5
    /// Scenario C). Unused for a plain TCP relay.
    pub peer: SocketAddr,
    pub auth: AuthState,
    pub socks_rules: Arc<RuleBase>,
    pub defaults: Arc<RuleDefaults>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_to_negotiating_is_legal() {
        assert!(SessionState::Accepted
            .can_transition_to(SessionState::Negotiating { renegotiation: false }));
    }

    #[test]
    fn closed_is_terminal_and_never_a_source() {
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closed.can_transition_to(SessionState::Negotiating {
            renegotiation: false
        }));
    }

    #[test]
    fn relaying_may_requeue_to_negotiating_for_http_reauth() {
        assert!(SessionState::Relaying
            .can_transition_to(SessionState::Negotiating { renegotiation: true }));
        // A *fresh* (non-renegotiation) negotiation from Relaying is not a
        // state the dispatcher ever produces.
        assert!(!SessionState::Relaying
            .can_transition_to(SessionState::Negotiating { renegotiation: false }));
    }
}
