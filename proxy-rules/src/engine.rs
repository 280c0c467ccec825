use std::net::Ipv4Addr;

use async_trait::async_trait;
use proxy_auth::{upgrade, AuthMethod, AuthState, MethodKind, UpgradeContext};
use proxy_io::SocksHost;

use crate::addr::{addrmatch, Protocol};
use crate::base::{RuleBase, RuleDefaults};
use crate::rule::{Command, ConnectionState, Rule, RuleClass, Verdict};

/// Everything the rule engine needs about the current session to
/// evaluate a rule base lookup (spec.md §4.4 step 0 inputs). `src`/`dst`
/// are `None` when the caller does not yet know that endpoint (spec.md
/// §4.4 steps 5d/5e "partial-information evaluation" — e.g. a
/// UDPREPLY/BINDREPLY lookup made before the reply's peer has connected).
#[derive(Debug, Clone)]
pub struct RuleInputs<'a> {
    pub src: Option<SocksHost>,
    pub dst: Option<SocksHost>,
    pub state: &'a ConnectionState,
    pub username: Option<&'a str>,
    pub resolved_aliases: &'a [Ipv4Addr],
}

/// Looks up whether `username` belongs to `group` (spec.md §4.4 step
/// "group membership check"). Group-database integration is out of
/// scope (spec.md §1); the default implementation treats every group
/// as empty so a rule requiring group membership always fails closed,
/// matching a deployment with no group backend configured.
#[async_trait]
pub trait AccessBackend: Send + Sync {
    async fn in_group(&self, username: &str, group: &str) -> bool;
    async fn in_ldap_group(&self, username: &str, attribute: &str, group: &str) -> bool;
    /// Runs `libwrap_cmd` against the connecting host and returns
    /// whether it permitted the connection. Process-spawn integration
    /// is out of scope (spec.md §1); the default always permits.
    async fn libwrap_permits(&self, _cmd: &str, _src: &SocksHost) -> bool {
        true
    }
    /// The step-2 global host-access gate (spec.md §4.4 step 2: "run a
    /// host-access list check against the peer before considering any
    /// rule; a denial returns the default-block rule with logging
    /// suppressed"), distinct from a matched rule's own `libwrap_cmd`
    /// (step 8). Process-spawn/hosts.allow integration is out of scope
    /// (spec.md §1); the default always permits.
    async fn host_access_permits(&self, _src: &SocksHost) -> bool {
        true
    }
}

/// A backend that denies every group check and permits every libwrap
/// check, i.e. the most conservative stand-in for "no backend
/// configured".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccessBackend;

#[async_trait]
impl AccessBackend for NoAccessBackend {
    async fn in_group(&self, _username: &str, _group: &str) -> bool {
        false
    }

    async fn in_ldap_group(&self, _username: &str, _attribute: &str, _group: &str) -> bool {
        false
    }
}

/// Performs the post-verdict reverse-DNS / forward-confirm source-host
/// check (spec.md C9, §4.4 step "source-host check"). Actually touching
/// a resolver is an I/O concern the caller's async runtime owns; the
/// default permissive stub is for rule-engine unit tests and for
/// deployments that do not want the extra round trip.
#[async_trait]
pub trait SourceHostCheck: Send + Sync {
    async fn check(&self, src: &SocksHost) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveSourceHostCheck;

#[async_trait]
impl SourceHostCheck for PermissiveSourceHostCheck {
    async fn check(&self, _src: &SocksHost) -> bool {
        true
    }
}

/// Identity oracle for RFC931/ident lookups (spec.md §4.4 step 5f). The
/// wire protocol for ident itself belongs to the negotiate stage, not
/// the rule engine; this trait is the seam the engine calls through to
/// get an already-fetched identity (or to trigger one).
#[async_trait]
pub trait IdentClient: Send + Sync {
    async fn lookup(&self, src: &SocksHost, dst_port: u16) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdentClient;

#[async_trait]
impl IdentClient for NoIdentClient {
    async fn lookup(&self, _src: &SocksHost, _dst_port: u16) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineVerdict {
    Pass {
        rule_number: usize,
        method: AuthMethod,
        username: Option<String>,
    },
    Block {
        rule_number: usize,
        /// Set by the step-2 global host-access gate (spec.md §4.4 step
        /// 2), whose denial is returned "with logging suppressed" rather
        /// than through a matched rule the caller would otherwise log.
        suppress_log: bool,
    },
}

impl EngineVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, EngineVerdict::Pass { .. })
    }

    fn block(rule_number: usize) -> Self {
        EngineVerdict::Block {
            rule_number,
            suppress_log: false,
        }
    }
}

/// Evaluates `base` against `inputs`, returning the first matching
/// rule's verdict or the synthetic default-block sentinel (spec.md
/// §4.4, the engine's 9-step algorithm). `auth` carries whatever
/// authentication state the session has already accumulated (e.g. a
/// prior method negotiation); the returned verdict's `method` is the
/// possibly-upgraded method the caller should continue the session
/// with. `defaults` supplies the global settings the per-rule loop
/// itself cannot see, such as `srchost.checkreplyauth`.
pub async fn rules_permit(
    base: &RuleBase,
    class: RuleClass,
    inputs: &RuleInputs<'_>,
    auth: &AuthState,
    defaults: &RuleDefaults,
    access: &dyn AccessBackend,
    ident: &dyn IdentClient,
    source_host: &dyn SourceHostCheck,
) -> EngineVerdict {
    // Step 1: class is selected by the caller via RuleClass::for_command
    // before this function is called.
    debug_assert_eq!(class, RuleClass::for_command(inputs.state.command));

    // Step 2: global host-access gate, run once regardless of which rule
    // would otherwise match (spec.md §4.4 step 2). Unlike the per-rule
    // `libwrap_cmd` check (step 8), a denial here is reported with
    // logging suppressed rather than as an ordinary matched-rule block.
    if let Some(src) = &inputs.src {
        if !access.host_access_permits(src).await {
            let sentinel = Rule::default_block();
            return EngineVerdict::Block {
                rule_number: sentinel.number,
                suppress_log: true,
            };
        }
    }

    for rule in base.rules() {
        // Step 2: command/protocol/version gates.
        if !rule.state.allows_command(inputs.state.command) {
            continue;
        }
        if !rule.state.allows_protocol(inputs.state.protocol) {
            continue;
        }
        if !rule.state.allows_version(inputs.state.version) {
            continue;
        }

        // Step 3: hostid constraint (only meaningful for Hostid-class
        // rules; a rule without a constraint matches any chain).
        if let Some(constraint) = &rule.hostid {
            let matches_chain = if constraint.index == 0 {
                inputs.state.hostid_chain.contains(&constraint.hostid)
            } else {
                inputs
                    .state
                    .hostid_chain
                    .get(constraint.index - 1)
                    .map(|h| *h == constraint.hostid)
                    .unwrap_or(false)
            };
            if !matches_chain {
                continue;
            }
        }

        // Step 4: address/port match against src and dst. When an
        // endpoint is unknown (spec.md §4.4 steps 5d/5e "partial-
        // information evaluation"), a BLOCK rule cannot be safely
        // matched against it and is skipped outright, while a PASS rule
        // is considered with that side's predicate untested — the
        // caller treats such a match as provisional and re-evaluates
        // once the endpoint becomes known (spec.md §8 scenario E).
        match &inputs.src {
            Some(src) => {
                if !endpoint_matches(&rule.src, src, inputs.state.protocol, inputs) {
                    continue;
                }
            }
            None => {
                if rule.verdict == Verdict::Block {
                    continue;
                }
            }
        }
        match &inputs.dst {
            Some(dst) => {
                if !endpoint_matches(&rule.dst, dst, inputs.state.protocol, inputs) {
                    continue;
                }
            }
            None => {
                if rule.verdict == Verdict::Block {
                    continue;
                }
            }
        }

        // Step 5: authentication. spec.md §4.4 step f: BINDREPLY/UDPREPLY
        // skip the normal method-upgrade precedence entirely when
        // `srchost.checkreplyauth` is disabled, forcing NONE instead.
        let mut current = auth.clone();
        if inputs.state.command.is_reply_only() && !defaults.checkreplyauth {
            current = AuthState::new(AuthMethod::None);
        } else if !rule.state.methods.is_empty() {
            let precedence: Vec<MethodKind> = rule.state.methods.clone();
            let ctx = UpgradeContext {
                ident_name: fetch_ident_if_needed(&precedence, ident, inputs).await,
                uname: auth
                    .method
                    .username()
                    .map(|name| (name.to_string(), String::new())),
                gssapi_allowed: rule.state.methods.contains(&MethodKind::Gssapi)
                    && inputs.state.command == Command::Accept,
            };
            match upgrade(&current, &precedence, &rule.state.methods, &ctx) {
                Some(upgraded) => current = AuthState::new(upgraded),
                None => continue, // no method in the rule's allowed set fits
            }
        }
        let method = current.method;

        // Step 5f/user binding: if the rule demands a user/group, the
        // (possibly just-upgraded) method must supply a username and it
        // must satisfy the binding.
        let username = method.username().map(|s| s.to_string());
        if rule.requires_username() {
            let Some(name) = username.as_deref() else {
                continue;
            };
            if !user_group_matches(rule, name, access).await {
                continue;
            }
        }

        // access_check / libwrap gate (spec.md §4.4 step 8): a per-rule
        // skip predicate evaluated only for the already-matched rule,
        // distinct from the step-2 global gate above. Without a known
        // source there is nothing to run the check against, so it is
        // skipped rather than treated as a denial.
        if let Some(cmd) = &rule.libwrap_cmd {
            if let Some(src) = &inputs.src {
                if !access.libwrap_permits(cmd, src).await {
                    continue;
                }
            }
        }

        let verdict = match rule.verdict {
            Verdict::Pass => EngineVerdict::Pass {
                rule_number: rule.number,
                method,
                username,
            },
            Verdict::Block => EngineVerdict::block(rule.number),
        };

        // Step: post-verdict source-host check only applies to a Pass
        // verdict (spec.md §4.4 "after a pass verdict, perform the
        // source-host check; failing it demotes to block"). With no
        // known source there is nothing to confirm, so the pass stands.
        if let EngineVerdict::Pass { rule_number, .. } = &verdict {
            if let Some(src) = &inputs.src {
                if !source_host.check(src).await {
                    return EngineVerdict::block(*rule_number);
                }
            }
        }

        return verdict;
    }

    // Step 6: default-block fallback — no rule matched.
    let sentinel = Rule::default_block();
    EngineVerdict::block(sentinel.number)
}

fn endpoint_matches(
    endpoint: &crate::addr::Endpoint,
    host: &SocksHost,
    protocol: Protocol,
    inputs: &RuleInputs<'_>,
) -> bool {
    if matches!(endpoint.addr, crate::addr::RuleAddr::NotSet) && endpoint.port.op == crate::addr::PortOp::None {
        return true;
    }
    addrmatch(endpoint, host, protocol, false, inputs.resolved_aliases)
}

async fn fetch_ident_if_needed(
    precedence: &[MethodKind],
    ident: &dyn IdentClient,
    inputs: &RuleInputs<'_>,
) -> Option<String> {
    // spec.md §4.4 step f: "RFC931 requires TCP" — a UDP session (e.g.
    // UDPASSOCIATE/UDPREPLY) never triggers an ident lookup even if the
    // rule's method precedence happens to list Rfc931.
    if inputs.state.protocol != Protocol::Tcp || !precedence.contains(&MethodKind::Rfc931) {
        return None;
    }
    let src = inputs.src.as_ref()?;
    let dst_port = inputs.dst.as_ref()?.port;
    ident.lookup(src, dst_port).await
}

async fn user_group_matches(rule: &Rule, username: &str, access: &dyn AccessBackend) -> bool {
    if rule.user.iter().any(|u| u == username) {
        return true;
    }
    for group in &rule.group {
        if access.in_group(username, group).await {
            return true;
        }
    }
    if let Some(ldap_groups) = &rule.ldap_group {
        let attribute = rule
            .state
            .method_params
            .ldap_attribute
            .as_deref()
            .unwrap_or("memberUid");
        for group in ldap_groups {
            if access.in_ldap_group(username, attribute, group).await {
                return true;
            }
        }
    }
    rule.user.is_empty() && rule.group.is_empty() && rule.ldap_group.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Endpoint, Port};
    use crate::base::{NullIfNameResolver, RuleBase, RuleDefaults};
    use proxy_io::HostAddr;

    fn state(command: Command) -> ConnectionState {
        ConnectionState::new(command, Protocol::Tcp, crate::rule::Version::V5)
    }

    fn host(port: u16) -> SocksHost {
        SocksHost::new(HostAddr::V4(Ipv4Addr::new(198, 51, 100, 9)), port)
    }

    #[tokio::test]
    async fn no_matching_rule_yields_default_block() {
        let base = RuleBase::new(RuleClass::Socks);
        let st = state(Command::Connect);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &RuleDefaults::default(),
            &NoAccessBackend,
            &NoIdentClient,
            &PermissiveSourceHostCheck,
        )
        .await;
        assert!(!verdict.is_pass());
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        base.add_rule(
            Rule::new(Verdict::Block, Endpoint::any(), Endpoint::any()),
            RuleClass::Socks,
            1,
            &defaults,
            &NullIfNameResolver,
        );
        base.add_rule(
            Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any()),
            RuleClass::Socks,
            2,
            &defaults,
            &NullIfNameResolver,
        );
        let st = state(Command::Connect);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &NoAccessBackend,
            &NoIdentClient,
            &PermissiveSourceHostCheck,
        )
        .await;
        match verdict {
            EngineVerdict::Block { rule_number, .. } => assert_eq!(rule_number, 1),
            EngineVerdict::Pass { .. } => panic!("expected the first rule (block) to win"),
        }
    }

    #[tokio::test]
    async fn port_predicate_excludes_nonmatching_rule() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        let restricted = Endpoint::new(crate::addr::RuleAddr::NotSet, Port::eq_both(443));
        base.add_rule(
            Rule::new(Verdict::Pass, Endpoint::any(), restricted),
            RuleClass::Socks,
            1,
            &defaults,
            &NullIfNameResolver,
        );
        let st = state(Command::Connect);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &NoAccessBackend,
            &NoIdentClient,
            &PermissiveSourceHostCheck,
        )
        .await;
        assert!(!verdict.is_pass());
    }

    #[tokio::test]
    async fn source_host_check_failure_demotes_pass_to_block() {
        struct AlwaysFail;
        #[async_trait]
        impl SourceHostCheck for AlwaysFail {
            async fn check(&self, _src: &SocksHost) -> bool {
                false
            }
        }

        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        base.add_rule(
            Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any()),
            RuleClass::Socks,
            1,
            &defaults,
            &NullIfNameResolver,
        );
        let st = state(Command::Connect);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &NoAccessBackend,
            &NoIdentClient,
            &AlwaysFail,
        )
        .await;
        assert!(!verdict.is_pass());
    }

    /// spec.md §8 scenario E: the engine is called for UDPREPLY with
    /// `src` unknown (the replying peer has not connected yet). Only
    /// PASS rules are even examined — a BLOCK rule is skipped outright —
    /// and the first PASS rule whose other predicates (dst, methods)
    /// do not contradict is returned as a provisional match.
    #[tokio::test]
    async fn udpreply_with_unknown_src_only_considers_pass_rules() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        // A BLOCK rule that would otherwise match everything must be
        // skipped since src is unknown.
        base.add_rule(
            Rule::new(Verdict::Block, Endpoint::any(), Endpoint::any()),
            RuleClass::Socks,
            1,
            &defaults,
            &NullIfNameResolver,
        );
        base.add_rule(
            Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any()),
            RuleClass::Socks,
            2,
            &defaults,
            &NullIfNameResolver,
        );
        let st = state(Command::UdpReply);
        let inputs = RuleInputs {
            src: None,
            dst: Some(host(53)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &NoAccessBackend,
            &NoIdentClient,
            &PermissiveSourceHostCheck,
        )
        .await;
        match verdict {
            EngineVerdict::Pass { rule_number, method, .. } => {
                assert_eq!(rule_number, 2);
                assert_eq!(method.kind(), MethodKind::None);
            }
            EngineVerdict::Block { .. } => panic!("expected the pass rule to win provisionally"),
        }
    }

    /// spec.md §4.4 step f: RFC931 never runs for a UDP session even if
    /// the rule's method precedence lists it.
    #[tokio::test]
    async fn rfc931_is_not_attempted_over_udp() {
        struct PanicsIfCalled;
        #[async_trait]
        impl IdentClient for PanicsIfCalled {
            async fn lookup(&self, _src: &SocksHost, _dst_port: u16) -> Option<String> {
                panic!("ident should never be queried for a udp session");
            }
        }

        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        let mut rule = Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any());
        rule.state.methods = vec![MethodKind::Rfc931];
        base.add_rule(rule, RuleClass::Socks, 1, &defaults, &NullIfNameResolver);

        let st = ConnectionState::new(Command::UdpAssociate, Protocol::Udp, crate::rule::Version::V5);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &NoAccessBackend,
            &PanicsIfCalled,
            &PermissiveSourceHostCheck,
        )
        .await;
        // No method in { Rfc931 } can be reached without ident, so the
        // rule does not match and the lookup above never runs.
        assert!(!verdict.is_pass());
    }

    /// spec.md §4.4 step f: with `srchost.checkreplyauth` disabled, a
    /// BINDREPLY/UDPREPLY lookup forces the method to NONE even when the
    /// matched rule's precedence only lists a stronger method.
    #[tokio::test]
    async fn checkreplyauth_disabled_forces_none_for_reply_commands() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults {
            checkreplyauth: false,
            ..RuleDefaults::default()
        };
        let mut rule = Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any());
        rule.state.methods = vec![MethodKind::Uname];
        base.add_rule(rule, RuleClass::Socks, 1, &defaults, &NullIfNameResolver);

        let st = state(Command::BindReply);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &NoAccessBackend,
            &NoIdentClient,
            &PermissiveSourceHostCheck,
        )
        .await;
        match verdict {
            EngineVerdict::Pass { method, .. } => assert_eq!(method.kind(), MethodKind::None),
            EngineVerdict::Block { .. } => panic!("expected a pass with method forced to none"),
        }
    }

    /// spec.md §4.4 step 2: the global host-access gate runs before any
    /// rule is considered, and its denial is reported with logging
    /// suppressed rather than via an ordinary matched-rule block.
    #[tokio::test]
    async fn global_host_access_denial_suppresses_logging() {
        struct AlwaysDeny;
        #[async_trait]
        impl AccessBackend for AlwaysDeny {
            async fn in_group(&self, _username: &str, _group: &str) -> bool {
                false
            }
            async fn in_ldap_group(&self, _username: &str, _attribute: &str, _group: &str) -> bool {
                false
            }
            async fn host_access_permits(&self, _src: &SocksHost) -> bool {
                false
            }
        }

        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        base.add_rule(
            Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any()),
            RuleClass::Socks,
            1,
            &defaults,
            &NullIfNameResolver,
        );
        let st = state(Command::Connect);
        let inputs = RuleInputs {
            src: Some(host(5000)),
            dst: Some(host(80)),
            state: &st,
            username: None,
            resolved_aliases: &[],
        };
        let verdict = rules_permit(
            &base,
            RuleClass::Socks,
            &inputs,
            &AuthState::default(),
            &defaults,
            &AlwaysDeny,
            &NoIdentClient,
            &PermissiveSourceHostCheck,
        )
        .await;
        match verdict {
            EngineVerdict::Block { suppress_log, .. } => assert!(suppress_log),
            EngineVerdict::Pass { .. } => panic!("expected the global gate to deny"),
        }
    }
}
