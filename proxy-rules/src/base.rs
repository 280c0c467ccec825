use std::net::Ipv4Addr;

use log::warn;
use proxy_auth::MethodKind;
use serde::{Deserialize, Serialize};

use crate::addr::{Endpoint, Protocol, RuleAddr};
use crate::rule::{Command, Rule, RuleClass, RuleState, Version};

/// Resolves an interface name to its first IPv4 address and netmask
/// (spec.md §4.1 `ifname2sockaddr`). Reading the host's actual
/// interface table is a platform compatibility concern out of scope
/// here (spec.md §1); callers inject a resolver so the defaulting
/// algorithm stays host-independent and testable.
pub trait IfNameResolver {
    /// Returns every IPv4 address configured on `name`, first address
    /// first. An empty vec means the name did not resolve.
    fn resolve(&self, name: &str) -> Vec<(Ipv4Addr, Ipv4Addr)>;
}

/// A resolver that never finds an interface; used where the caller has
/// no real interface table (e.g. rule-base unit tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIfNameResolver;

impl IfNameResolver for NullIfNameResolver {
    fn resolve(&self, _name: &str) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        Vec::new()
    }
}

/// The subset of global configuration the defaulting algorithm needs
/// (spec.md §4.2). The full configuration grammar/parser is out of
/// scope (spec.md §1); this is the narrow slice `add_rule` reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefaults {
    #[serde(default)]
    pub debug: bool,
    /// Method precedence for client-class rules when a rule's method
    /// list is left empty.
    #[serde(default)]
    pub client_methodv: Vec<MethodKind>,
    /// Method precedence for socks-class rules.
    #[serde(default)]
    pub socks_methodv: Vec<MethodKind>,
    #[serde(default)]
    pub supported_versions: Vec<Version>,
    #[serde(default)]
    pub default_servicename: String,
    #[serde(default)]
    pub default_keytab: String,
    #[serde(default)]
    pub default_ldap_attribute: String,
    /// The global `srchost.checkreplyauth` switch (spec.md §4.4 step f):
    /// when false, BINDREPLY/UDPREPLY lookups force the method to NONE
    /// instead of running the normal method-upgrade precedence.
    #[serde(default = "default_checkreplyauth")]
    pub checkreplyauth: bool,
}

fn default_checkreplyauth() -> bool {
    true
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            debug: false,
            client_methodv: vec![MethodKind::None],
            socks_methodv: vec![MethodKind::None],
            supported_versions: vec![Version::V4, Version::V5, Version::Http10, Version::Http11],
            default_servicename: "rcmd".to_string(),
            default_keytab: String::new(),
            default_ldap_attribute: "memberUid".to_string(),
            checkreplyauth: true,
        }
    }
}

/// An ordered ACL list (spec.md §3 "RuleBase"). Backed by a `Vec`
/// rather than a linked list per spec.md §9's slab-arena decision:
/// `next` becomes implicit successor-by-index.
#[derive(Debug, Clone, Default)]
pub struct RuleBase {
    pub class: Option<RuleClass>,
    rules: Vec<Rule>,
}

impl RuleBase {
    pub fn new(class: RuleClass) -> Self {
        Self {
            class: Some(class),
            rules: Vec::new(),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Appends `rule`, assigns its `number`/`line`, and applies the
    /// defaulting algorithm (spec.md §4.2). Returns the stored copy.
    pub fn add_rule(
        &mut self,
        mut rule: Rule,
        class: RuleClass,
        line: usize,
        defaults: &RuleDefaults,
        ifname: &dyn IfNameResolver,
    ) -> &Rule {
        rule.number = self.rules.len() + 1;
        rule.line = line;
        apply_defaults(&mut rule, class, defaults, ifname);
        self.rules.push(rule);
        self.rules.last().expect("just pushed")
    }

    pub fn validate_all(&self, class: RuleClass) -> Result<(), ValidationError> {
        for rule in &self.rules {
            validate(rule, class)?;
        }
        Ok(())
    }
}

fn apply_defaults(
    rule: &mut Rule,
    class: RuleClass,
    defaults: &RuleDefaults,
    ifname: &dyn IfNameResolver,
) {
    // Step 1: resolve IfName source/destination to the interface's first
    // IPv4 + mask, warning on additional addresses.
    for endpoint in [&mut rule.src, &mut rule.dst] {
        if let RuleAddr::IfName(name) = &endpoint.addr {
            let addrs = ifname.resolve(name);
            match addrs.first() {
                Some((addr, mask)) => {
                    if addrs.len() > 1 {
                        warn!(
                            "interface {} has {} addresses, using the first one for rule",
                            name,
                            addrs.len()
                        );
                    }
                    endpoint.addr = RuleAddr::Ipv4 {
                        addr: *addr,
                        mask: *mask,
                    };
                }
                None => warn!("interface {} did not resolve to any address", name),
            }
        }
    }

    // Step 2: populate log flags from the global debug flag.
    if defaults.debug {
        rule.log_flags |= crate::rule::LogFlags::ERROR;
    }

    // Step 3: protocol/command coupling.
    let proto_set = !rule.state.protocols.is_empty();
    let cmd_set = !rule.state.commands.is_empty();
    match (proto_set, cmd_set) {
        (true, false) => {
            for protocol in rule.state.protocols.clone() {
                rule.state
                    .commands
                    .extend(Command::applicable_to(protocol).iter().copied());
            }
        }
        (false, true) => {
            for command in rule.state.commands.clone() {
                rule.state.protocols.insert(command.implies_protocol());
            }
        }
        (false, false) => {
            rule.state.protocols.insert(Protocol::Tcp);
            rule.state.protocols.insert(Protocol::Udp);
            rule.state
                .commands
                .extend(Command::applicable_to(Protocol::Tcp).iter().copied());
            rule.state
                .commands
                .extend(Command::applicable_to(Protocol::Udp).iter().copied());
        }
        (true, true) => {
            for command in rule.state.commands.clone() {
                if !rule.state.protocols.contains(&command.implies_protocol()) {
                    warn!(
                        "rule {} enables command {:?} whose protocol is not enabled",
                        rule.number, command
                    );
                }
            }
        }
    }

    // Step 4: fill the method list from the applicable global vector,
    // skipping methods that cannot apply.
    if rule.state.methods.is_empty() {
        let candidates = match class {
            RuleClass::Client | RuleClass::Hostid => &defaults.client_methodv,
            RuleClass::Socks => &defaults.socks_methodv,
        };
        let reply_only = rule.state.commands.iter().all(|c| c.is_reply_only())
            && !rule.state.commands.is_empty();
        for method in candidates {
            let suppressed = match method {
                MethodKind::Rfc931 => {
                    !rule.state.protocols.contains(&Protocol::Tcp) || reply_only
                }
                MethodKind::Gssapi => reply_only,
                MethodKind::Uname => reply_only || rule.requires_username(),
                _ => false,
            };
            if !suppressed {
                rule.state.methods.push(*method);
            }
        }
    }

    // Step 5: if the rule has no proxy-protocol mask, enable every
    // supported version.
    if rule.state.versions.is_empty() {
        rule.state.versions.extend(defaults.supported_versions.iter().copied());
    }

    // Step 6: populate default servicenames/keytabs/LDAP attributes.
    if rule.state.method_params.gssapi_servicename.is_none() {
        rule.state.method_params.gssapi_servicename = Some(defaults.default_servicename.clone());
    }
    if rule.state.method_params.gssapi_keytab.is_none() {
        rule.state.method_params.gssapi_keytab = Some(defaults.default_keytab.clone());
    }
    if rule.state.method_params.ldap_attribute.is_none() {
        rule.state.method_params.ldap_attribute = Some(defaults.default_ldap_attribute.clone());
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("rule {number} (line {line}): non-socks rule used a socks-only method {method:?}")]
    MethodNotValidForClass {
        number: usize,
        line: usize,
        method: MethodKind,
    },
    #[error("rule {number} (line {line}): rfc931 cannot be combined with a udpreply-only command set")]
    Rfc931WithUdpReplyOnly { number: usize, line: usize },
    #[error("rule {number} (line {line}): user/group is set but no method can provide a username")]
    UserWithoutUsernameMethod { number: usize, line: usize },
    #[error("rule {number} (line {line}): redirection target must be IPv4 or Domain")]
    BadRedirectionTarget { number: usize, line: usize },
}

/// Structural validation (spec.md §4.2 "Validation rules").
pub fn validate(rule: &Rule, class: RuleClass) -> Result<(), ValidationError> {
    if class != RuleClass::Socks {
        for method in &rule.state.methods {
            if matches!(method, MethodKind::Gssapi) {
                return Err(ValidationError::MethodNotValidForClass {
                    number: rule.number,
                    line: rule.line,
                    method: *method,
                });
            }
        }
    }

    let reply_only = !rule.state.commands.is_empty()
        && rule.state.commands.iter().all(|c| c.is_reply_only());
    if reply_only
        && rule
            .state
            .commands
            .contains(&Command::UdpReply)
            && rule.state.methods.contains(&MethodKind::Rfc931)
    {
        return Err(ValidationError::Rfc931WithUdpReplyOnly {
            number: rule.number,
            line: rule.line,
        });
    }

    if rule.requires_username() {
        let can_provide_username = rule.state.methods.iter().any(|m| {
            matches!(
                m,
                MethodKind::Uname | MethodKind::Rfc931 | MethodKind::Pam | MethodKind::BsdAuth
            )
        });
        if !can_provide_username {
            return Err(ValidationError::UserWithoutUsernameMethod {
                number: rule.number,
                line: rule.line,
            });
        }
    }

    if let Some(to) = &rule.rdr_to {
        if matches!(to.addr, RuleAddr::NotSet | RuleAddr::IfName(_)) {
            return Err(ValidationError::BadRedirectionTarget {
                number: rule.number,
                line: rule.line,
            });
        }
    }

    Ok(())
}

/// Synthesizes the two auxiliary socks-rules a UDP-enabled client-rule
/// implies (spec.md §4.5 "For the UDP-associate case" / §8 scenario C):
/// an outbound `UdpAssociate` rule with `dst = bounce_to`, and — when
/// `udp_connect_dst` is set — an inbound `UdpReply` rule with
/// `src = bounce_to`, else a wildcard source.
pub fn synthesize_udp_rules(bounce_to: Endpoint, udp_connect_dst: bool) -> (Rule, Option<Rule>) {
    let mut outbound = Rule::new(crate::rule::Verdict::Pass, Endpoint::any(), bounce_to.clone());
    outbound.state.commands.insert(Command::UdpAssociate);
    outbound.state.protocols.insert(Protocol::Udp);

    let inbound = if udp_connect_dst {
        let mut r = Rule::new(crate::rule::Verdict::Pass, bounce_to, Endpoint::any());
        r.state.commands.insert(Command::UdpReply);
        r.state.protocols.insert(Protocol::Udp);
        Some(r)
    } else {
        None
    };

    (outbound, inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Port;
    use crate::rule::Verdict;

    #[test]
    fn rule_numbers_are_one_based_dense_and_ascending() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        for _ in 0..3 {
            base.add_rule(
                Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any()),
                RuleClass::Socks,
                1,
                &defaults,
                &NullIfNameResolver,
            );
        }
        let numbers: Vec<usize> = base.rules().iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn protocol_only_rule_enables_matching_commands() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults::default();
        let mut rule = Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any());
        rule.state.protocols.insert(Protocol::Udp);
        let stored = base.add_rule(rule, RuleClass::Socks, 1, &defaults, &NullIfNameResolver);
        assert!(stored.state.commands.contains(&Command::UdpAssociate));
        assert!(stored.state.commands.contains(&Command::UdpReply));
        assert!(!stored.state.commands.contains(&Command::Connect));
    }

    #[test]
    fn empty_method_list_is_filled_from_global_vector() {
        let mut base = RuleBase::new(RuleClass::Socks);
        let defaults = RuleDefaults {
            socks_methodv: vec![MethodKind::None, MethodKind::Rfc931],
            ..RuleDefaults::default()
        };
        let rule = Rule::new(Verdict::Pass, Endpoint::any(), Endpoint::any());
        let stored = base.add_rule(rule, RuleClass::Socks, 1, &defaults, &NullIfNameResolver);
        assert!(stored.state.methods.contains(&MethodKind::None));
        assert!(stored.state.methods.contains(&MethodKind::Rfc931));
    }

    #[test]
    fn udp_client_rule_synthesizes_exactly_two_socks_rules() {
        let bounce = Endpoint::new(
            RuleAddr::Ipv4 {
                addr: Ipv4Addr::new(203, 0, 113, 1),
                mask: Ipv4Addr::new(255, 255, 255, 255),
            },
            Port::eq_both(0),
        );
        let (outbound, inbound) = synthesize_udp_rules(bounce, true);
        assert!(outbound.state.commands.contains(&Command::UdpAssociate));
        let inbound = inbound.expect("udp_connect_dst was set");
        assert!(inbound.state.commands.contains(&Command::UdpReply));
    }
}
