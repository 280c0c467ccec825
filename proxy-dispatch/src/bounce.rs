//! The `BOUNCETO` command's "non-negotiating UDP forwarder" (spec.md §3
//! `Command::Bounceto`, GLOSSARY "Bounce-to"). Unlike `UdpAssociate`,
//! which is negotiated by a client that has already completed a SOCKS
//! handshake, a bounce listener accepts raw datagrams from day one and
//! relays each one to whatever fixed address the matched client-rule
//! names — there is no method negotiation, no request parsing, and no
//! per-connection state beyond "which peer goes with which fixed
//! destination".

use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, warn};
use proxy_auth::AuthState;
use proxy_rules::{
    rules_permit, AccessBackend, Command, ConnectionState, EngineVerdict, IdentClient, Protocol,
    RuleClass, RuleInputs, SourceHostCheck, Version,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::ConfigSnapshot;

/// Binds `listen` and relays datagrams until the socket errors
/// unrecoverably. The first datagram from a given peer is matched
/// against the client-rule base with `Command::Bounceto` (spec.md §4.4
/// step 1 "`ACCEPT`/`BOUNCETO` → client") to learn its fixed destination;
/// subsequent datagrams from either side of that pairing skip the rule
/// check, matching the "non-negotiating" name — the destination was
/// settled once, not renegotiated per packet. `config` is re-borrowed on
/// every first-contact lookup so a SIGHUP reload takes effect for peers
/// that haven't paired up yet, the same way the dispatcher's accept loop
/// re-borrows its snapshot per connection.
pub async fn run_bounce_forwarder(
    listen: SocketAddr,
    config: watch::Receiver<ConfigSnapshot>,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(listen).await?;
    let mut buf = [0u8; 65507];
    let mut peers: HashMap<SocketAddr, SocketAddr> = HashMap::new();

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;

        let dst = match peers.get(&from).copied() {
            Some(known) => known,
            None => {
                let snapshot = config.borrow().clone();
                let Some(dst) =
                    resolve_bounce_target(&snapshot, from, listen, access, ident, source_host).await
                else {
                    continue;
                };
                peers.insert(from, dst);
                peers.insert(dst, from);
                dst
            }
        };

        socket.send_to(&buf[..n], dst).await?;
    }
}

async fn resolve_bounce_target(
    snapshot: &ConfigSnapshot,
    from: SocketAddr,
    listen: SocketAddr,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> Option<SocketAddr> {
    let state = ConnectionState::new(Command::Bounceto, Protocol::Udp, Version::V5);
    let inputs = RuleInputs {
        src: Some(from.into()),
        dst: Some(listen.into()),
        state: &state,
        username: None,
        resolved_aliases: &[],
    };
    let verdict = rules_permit(
        &snapshot.client_rules,
        RuleClass::Client,
        &inputs,
        &AuthState::default(),
        &snapshot.defaults,
        access,
        ident,
        source_host,
    )
    .await;

    let EngineVerdict::Pass { rule_number, .. } = verdict else {
        debug!("bounceto: no matching client-rule for {}, dropping datagram", from);
        return None;
    };
    let Some(rule) = snapshot.client_rules.rules().iter().find(|r| r.number == rule_number) else {
        return None;
    };
    let Some(dst) = rule.dst.fixed_socket_addr() else {
        warn!(
            "bounceto rule #{} has no single fixed destination, dropping datagram from {}",
            rule_number, from
        );
        return None;
    };
    Some(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_rules::{Endpoint, Port, Rule, RuleAddr, RuleBase, RuleClass as RC, RuleDefaults, Verdict};
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;

    fn snapshot_with_bounce_rule(dst: SocketAddr) -> ConfigSnapshot {
        let mut client_rules = RuleBase::new(RC::Client);
        let dst_addr = match dst {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => panic!("test uses v4 only"),
        };
        let mut rule = Rule::new(
            Verdict::Pass,
            Endpoint::any(),
            Endpoint::new(
                RuleAddr::Ipv4 {
                    addr: dst_addr,
                    mask: Ipv4Addr::new(255, 255, 255, 255),
                },
                Port::eq_both(dst.port()),
            ),
        );
        rule.state.commands.insert(Command::Bounceto);
        rule.state.protocols.insert(Protocol::Udp);
        client_rules.add_rule(rule, RC::Client, 1, &RuleDefaults::default(), &proxy_rules::NullIfNameResolver);

        ConfigSnapshot::new(
            client_rules,
            RuleBase::new(RC::Hostid),
            RuleBase::new(RC::Socks),
            RuleDefaults::default(),
        )
    }

    #[tokio::test]
    async fn datagram_is_relayed_to_the_rules_fixed_destination() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let snapshot = snapshot_with_bounce_rule(echo_addr);
        let (_tx, rx) = watch::channel(snapshot);
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = tokio::spawn(async move {
            let _ = run_bounce_forwarder(
                listen_addr,
                rx,
                &proxy_rules::NoAccessBackend,
                &proxy_rules::NoIdentClient,
                &proxy_rules::PermissiveSourceHostCheck,
            )
            .await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", listen_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(1), echo.recv_from(&mut buf))
            .await
            .expect("echo socket should receive the forwarded datagram")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        forwarder.abort();
    }

    #[tokio::test]
    async fn datagram_from_an_unmatched_peer_is_dropped() {
        let snapshot = ConfigSnapshot::new(
            RuleBase::new(RC::Client),
            RuleBase::new(RC::Hostid),
            RuleBase::new(RC::Socks),
            RuleDefaults::default(),
        );
        let (_tx, rx) = watch::channel(snapshot);
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = tokio::spawn(async move {
            let _ = run_bounce_forwarder(
                listen_addr,
                rx,
                &proxy_rules::NoAccessBackend,
                &proxy_rules::NoIdentClient,
                &proxy_rules::PermissiveSourceHostCheck,
            )
            .await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", listen_addr).await.unwrap();
        // No client-rule matches (empty base), so nothing is forwarded
        // anywhere; the forwarder just keeps running.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        forwarder.abort();
    }
}
