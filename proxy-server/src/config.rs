//! On-disk configuration (spec.md §6 "Configuration & CLI"). The wire
//! format itself is free-form (spec.md §1 excludes "command-line grammar
//! beyond" the flags this binary actually parses), so this mirrors the
//! teacher's own approach — a TOML file loaded with `toml`/`serde`, plus
//! a built-in default ruleset the user's file is laid in front of —
//! rather than inventing byte-for-byte compatibility with any existing
//! proxy's rule syntax.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use etcetera::base_strategy::{choose_base_strategy, BaseStrategy};
use proxy_auth::MethodKind;
use proxy_rules::{
    synthesize_udp_rules, Command, Endpoint, HostIdConstraint, LogFlags, NullIfNameResolver, Port,
    PortOp, Protocol, Rule, RuleAddr, RuleBase, RuleClass, RuleDefaults, Verdict, Version,
};
use serde::{Deserialize, Serialize};

const DEFAULT_RULES_TOML: &str = include_str!("../default_rules.toml");

/// Top-level shape of a config file: listener/pidfile settings, the
/// global rule defaults, and the three rule bases in file order
/// (spec.md §3 "RuleBase", one per `RuleClass`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub client: Vec<RuleSpec>,
    #[serde(default)]
    pub hostid: Vec<RuleSpec>,
    #[serde(default)]
    pub socks: Vec<RuleSpec>,
}

impl FileConfig {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Addresses this binary listens for client connections on (spec.md
    /// §3 "Listener", internal side). Multiple listeners share one
    /// dispatcher and rule base, per SPEC_FULL §5.
    #[serde(default = "default_listen")]
    pub internal: Vec<String>,
    /// Local bind addresses for a non-negotiating UDP bounce forwarder
    /// (spec.md GLOSSARY "Bounce-to") instead of the SOCKS/HTTP
    /// dispatcher. This is distinct from the destinations a client-rule's
    /// `bounce_to` registers via `LoadedRules::udp_listen_addrs` (spec.md
    /// §8 Scenario C "adds `rule.dst` to the UDP listener list exactly
    /// once") — those name a remote peer the rule forwards to, not a
    /// local socket this binary can bind. A deployment that wants an
    /// actual `BOUNCETO` listener lists its bind address here.
    #[serde(default)]
    pub internal_udp: Vec<String>,
    /// Optional pidfile path (spec.md §6 "Persisted state").
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            internal: default_listen(),
            internal_udp: Vec::new(),
            pidfile: None,
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["127.0.0.1:1080".to_string()]
}

/// The subset of global configuration `RuleBase::add_rule`'s defaulting
/// algorithm reads (spec.md §4.2), in the author-facing string form a
/// TOML file carries it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_methods")]
    pub client_methods: Vec<String>,
    #[serde(default = "default_methods")]
    pub socks_methods: Vec<String>,
    #[serde(default = "default_versions")]
    pub versions: Vec<String>,
    #[serde(default = "default_servicename")]
    pub servicename: String,
    #[serde(default)]
    pub keytab: String,
    #[serde(default = "default_ldap_attribute")]
    pub ldap_attribute: String,
    /// The global `srchost.checkreplyauth` switch (spec.md §4.4 step f):
    /// when false, BINDREPLY/UDPREPLY sessions are always forced to the
    /// NONE method regardless of what the matched rule's method list
    /// says.
    #[serde(default = "default_checkreplyauth")]
    pub checkreplyauth: bool,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            debug: false,
            client_methods: default_methods(),
            socks_methods: default_methods(),
            versions: default_versions(),
            servicename: default_servicename(),
            keytab: String::new(),
            ldap_attribute: default_ldap_attribute(),
            checkreplyauth: default_checkreplyauth(),
        }
    }
}

fn default_methods() -> Vec<String> {
    vec!["none".to_string()]
}

fn default_versions() -> Vec<String> {
    vec!["v4".into(), "v5".into(), "http10".into(), "http11".into()]
}

fn default_servicename() -> String {
    "rcmd".to_string()
}

fn default_ldap_attribute() -> String {
    "memberUid".to_string()
}

fn default_checkreplyauth() -> bool {
    true
}

impl DefaultsSection {
    fn into_rule_defaults(self) -> anyhow::Result<RuleDefaults> {
        Ok(RuleDefaults {
            debug: self.debug,
            client_methodv: parse_methods(&self.client_methods)?,
            socks_methodv: parse_methods(&self.socks_methods)?,
            supported_versions: parse_versions(&self.versions)?,
            default_servicename: self.servicename,
            default_keytab: self.keytab,
            default_ldap_attribute: self.ldap_attribute,
            checkreplyauth: self.checkreplyauth,
        })
    }
}

/// One ACL entry as an author writes it (spec.md §3 "Rule"), before the
/// string fields are parsed into the engine's concrete `RuleAddr`/`Port`/
/// `Command` types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub verdict: String,
    #[serde(default = "any_string")]
    pub src_addr: String,
    #[serde(default = "any_string")]
    pub src_port: String,
    #[serde(default = "any_string")]
    pub dst_addr: String,
    #[serde(default = "any_string")]
    pub dst_port: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub user: Vec<String>,
    #[serde(default)]
    pub group: Vec<String>,
    #[serde(default)]
    pub hostid: Option<u32>,
    #[serde(default)]
    pub hostid_index: usize,
    #[serde(default)]
    pub log: Vec<String>,
    /// `"addr:port"` of the fixed UDP destination this client-rule
    /// bounces to (spec.md §3 "Rule", §4.2, GLOSSARY "Bounce-to"). Only
    /// meaningful on a `protocols = ["udp"]` client-rule; when set, the
    /// loader synthesizes the outbound/inbound socks-rule pair (spec.md
    /// §8 Scenario C) and registers `addr` as a UDP listener.
    #[serde(default)]
    pub bounce_to: Option<String>,
    /// Whether the synthesized inbound rule requires the reply to come
    /// from the connected destination (spec.md §3 Config "UDP-connect-dst
    /// flag") rather than accepting a wildcard source.
    #[serde(default)]
    pub udp_connect_dst: bool,
}

fn any_string() -> String {
    "any".to_string()
}

impl RuleSpec {
    fn to_rule(&self) -> anyhow::Result<Rule> {
        let verdict = parse_verdict(&self.verdict)?;
        let src = Endpoint::new(parse_addr(&self.src_addr)?, parse_port(&self.src_port)?);
        let dst = Endpoint::new(parse_addr(&self.dst_addr)?, parse_port(&self.dst_port)?);
        let mut rule = Rule::new(verdict, src, dst);

        rule.state.commands = parse_commands(&self.commands)?;
        rule.state.protocols = parse_protocols(&self.protocols)?;
        rule.state.versions = parse_versions(&self.versions)?.into_iter().collect();
        rule.state.methods = parse_methods(&self.methods)?;
        rule.user = self.user.clone();
        rule.group = self.group.clone();
        rule.hostid = self.hostid.map(|hostid| HostIdConstraint {
            hostid,
            index: self.hostid_index,
        });
        rule.log_flags = parse_log_flags(&self.log)?;
        Ok(rule)
    }
}

/// `"addr:port"`, where `port = 0` means "any port" (spec.md §8 Scenario
/// C's `bounce-to 203.0.113.1:0`).
fn parse_bounce_to(s: &str) -> anyhow::Result<Endpoint> {
    let (addr, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("bounce_to {:?} is missing a port", s))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid bounce_to address in {:?}", s))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid bounce_to port in {:?}", s))?;
    let port = if port == 0 { Port::any() } else { Port::eq_both(port) };
    Ok(Endpoint::new(
        RuleAddr::Ipv4 {
            addr,
            mask: Ipv4Addr::new(255, 255, 255, 255),
        },
        port,
    ))
}

fn parse_verdict(s: &str) -> anyhow::Result<Verdict> {
    match s {
        "pass" => Ok(Verdict::Pass),
        "block" => Ok(Verdict::Block),
        other => Err(anyhow!("unknown verdict {:?}, expected pass or block", other)),
    }
}

/// `"any"`, `"%eth0"` (interface name), `"10.0.0.0/24"` (IPv4/netmask),
/// a bare IPv4 literal (treated as a /32), or a bare domain name.
fn parse_addr(s: &str) -> anyhow::Result<RuleAddr> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("any") || s.is_empty() {
        return Ok(RuleAddr::NotSet);
    }
    if let Some(ifname) = s.strip_prefix('%') {
        return Ok(RuleAddr::IfName(ifname.to_string()));
    }
    if let Some((addr, mask)) = s.split_once('/') {
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("invalid IPv4 address in {:?}", s))?;
        let mask = parse_mask(mask).with_context(|| format!("invalid netmask in {:?}", s))?;
        return Ok(RuleAddr::Ipv4 { addr, mask });
    }
    if let Ok(addr) = Ipv4Addr::from_str(s) {
        return Ok(RuleAddr::Ipv4 {
            addr,
            mask: Ipv4Addr::new(255, 255, 255, 255),
        });
    }
    Ok(RuleAddr::Domain(s.to_string()))
}

/// Accepts either dotted-quad (`255.255.255.0`) or CIDR prefix-length
/// (`24`) netmask notation.
fn parse_mask(s: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(addr) = Ipv4Addr::from_str(s) {
        return Ok(addr);
    }
    let bits: u32 = s.parse().with_context(|| format!("not a netmask: {:?}", s))?;
    if bits > 32 {
        return Err(anyhow!("netmask prefix {} is out of range", bits));
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ok(Ipv4Addr::from(mask))
}

/// `"any"`, `"eq 80"`, `"ne 80"`, `"ge 1024"`, `"le 1024"`, `"gt 1024"`,
/// `"lt 1024"`, or `"range 1024 65535"` — same value used for both the
/// TCP and UDP port fields (spec.md §3 "Port" carries both, but a single
/// config entry only ever names one protocol's worth of ports).
fn parse_port(s: &str) -> anyhow::Result<Port> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("any") || s.is_empty() {
        return Ok(Port::any());
    }
    let mut parts = s.split_whitespace();
    let op = parts.next().ok_or_else(|| anyhow!("empty port spec"))?;
    let op = match op {
        "eq" => PortOp::Eq,
        "ne" => PortOp::Ne,
        "ge" => PortOp::Ge,
        "le" => PortOp::Le,
        "gt" => PortOp::Gt,
        "lt" => PortOp::Lt,
        "range" => PortOp::Range,
        other => return Err(anyhow!("unknown port operator {:?}", other)),
    };
    let value: u16 = parts
        .next()
        .ok_or_else(|| anyhow!("port spec {:?} is missing a value", s))?
        .parse()
        .with_context(|| format!("invalid port in {:?}", s))?;
    let end = if op == PortOp::Range {
        parts
            .next()
            .ok_or_else(|| anyhow!("range port spec {:?} is missing an end value", s))?
            .parse()
            .with_context(|| format!("invalid range end in {:?}", s))?
    } else {
        0
    };
    Ok(Port {
        tcp: value,
        udp: value,
        op,
        end,
    })
}

fn parse_commands(values: &[String]) -> anyhow::Result<HashSet<Command>> {
    values
        .iter()
        .map(|v| match v.as_str() {
            "accept" => Ok(Command::Accept),
            "bounceto" => Ok(Command::Bounceto),
            "hostid" => Ok(Command::Hostid),
            "bind" => Ok(Command::Bind),
            "connect" => Ok(Command::Connect),
            "udpassociate" => Ok(Command::UdpAssociate),
            "bindreply" => Ok(Command::BindReply),
            "udpreply" => Ok(Command::UdpReply),
            other => Err(anyhow!("unknown command {:?}", other)),
        })
        .collect()
}

fn parse_protocols(values: &[String]) -> anyhow::Result<HashSet<Protocol>> {
    values
        .iter()
        .map(|v| match v.as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(anyhow!("unknown protocol {:?}", other)),
        })
        .collect()
}

fn parse_versions(values: &[String]) -> anyhow::Result<Vec<Version>> {
    values
        .iter()
        .map(|v| match v.as_str() {
            "v4" => Ok(Version::V4),
            "v5" => Ok(Version::V5),
            "http10" => Ok(Version::Http10),
            "http11" => Ok(Version::Http11),
            other => Err(anyhow!("unknown proxy version {:?}", other)),
        })
        .collect()
}

fn parse_methods(values: &[String]) -> anyhow::Result<Vec<MethodKind>> {
    values
        .iter()
        .map(|v| match v.as_str() {
            "notset" => Ok(MethodKind::NotSet),
            "none" => Ok(MethodKind::None),
            "uname" => Ok(MethodKind::Uname),
            "rfc931" => Ok(MethodKind::Rfc931),
            "pam" => Ok(MethodKind::Pam),
            "bsdauth" => Ok(MethodKind::BsdAuth),
            "gssapi" => Ok(MethodKind::Gssapi),
            other => Err(anyhow!("unknown authentication method {:?}", other)),
        })
        .collect()
}

fn parse_log_flags(values: &[String]) -> anyhow::Result<LogFlags> {
    let mut flags = LogFlags::empty();
    for v in values {
        flags |= match v.as_str() {
            "connect" => LogFlags::CONNECT,
            "disconnect" => LogFlags::DISCONNECT,
            "iooperation" => LogFlags::IOOP,
            "error" => LogFlags::ERROR,
            other => return Err(anyhow!("unknown log flag {:?}", other)),
        };
    }
    Ok(flags)
}

/// Builds one `RuleBase` from the parsed specs (spec.md §4.2). The
/// caller's entries come first, so a more specific rule can preempt the
/// built-in default it's laid in front of; `line` is the 1-based
/// position within this base.
fn load_rule_base(specs: &[RuleSpec], class: RuleClass, defaults: &RuleDefaults) -> anyhow::Result<RuleBase> {
    let mut base = RuleBase::new(class);
    for (i, spec) in specs.iter().enumerate() {
        let rule = spec
            .to_rule()
            .with_context(|| format!("rule #{} in the {:?} base", i + 1, class))?;
        base.add_rule(rule, class, i + 1, defaults, &NullIfNameResolver);
    }
    base.validate_all(class)?;
    Ok(base)
}

/// The three rule bases and defaults this binary needs to build a
/// `proxy_dispatch::ConfigSnapshot`.
pub struct LoadedRules {
    pub client: RuleBase,
    pub hostid: RuleBase,
    pub socks: RuleBase,
    pub defaults: RuleDefaults,
    /// UDP addresses a `bounce_to` client-rule synthesized (spec.md §8
    /// Scenario C "adds `rule.dst` to the UDP listener list exactly
    /// once"), deduplicated by address. The caller merges these into its
    /// own UDP listener set alongside any explicitly configured ones.
    pub udp_listen_addrs: Vec<std::net::SocketAddr>,
}

/// Parses `file` (if given), lays its rule entries in front of the
/// built-in default ruleset, and builds all three rule bases. A missing
/// on-disk file is not an error: the built-in defaults alone are a
/// usable (if conservative) configuration, mirroring the teacher's
/// "ship a sane rules.toml, let the user override it" approach.
pub fn load_rules(user: Option<FileConfig>) -> anyhow::Result<LoadedRules> {
    let builtin: FileConfig =
        toml::from_str(DEFAULT_RULES_TOML).context("parsing the built-in default ruleset")?;
    let (server_defaults, client, hostid, socks) = match user {
        Some(user) => (
            user.defaults,
            [user.client, builtin.client].concat(),
            [user.hostid, builtin.hostid].concat(),
            [user.socks, builtin.socks].concat(),
        ),
        None => (builtin.defaults, builtin.client, builtin.hostid, builtin.socks),
    };

    let defaults = server_defaults.into_rule_defaults()?;
    let client_base = load_rule_base(&client, RuleClass::Client, &defaults)?;
    let mut socks_base = load_rule_base(&socks, RuleClass::Socks, &defaults)?;

    let mut udp_listen_addrs = Vec::new();
    for (i, spec) in client.iter().enumerate() {
        let Some(bounce_to) = &spec.bounce_to else { continue };
        if spec.verdict != "pass" || !spec.protocols.iter().any(|p| p == "udp") {
            continue;
        }
        let bounce_endpoint = parse_bounce_to(bounce_to)
            .with_context(|| format!("bounce_to in client rule #{}", i + 1))?;
        // Scenario C dedups by address alone (the port may be the
        // wildcard `0`, meaning "any port"), so this doesn't reuse
        // `Endpoint::fixed_socket_addr`'s stricter exact-port match.
        if let RuleAddr::Ipv4 { addr, .. } = &bounce_endpoint.addr {
            let listen_addr = std::net::SocketAddr::new(std::net::IpAddr::V4(*addr), 0);
            if !udp_listen_addrs.contains(&listen_addr) {
                udp_listen_addrs.push(listen_addr);
            }
        }
        let (outbound, inbound) = synthesize_udp_rules(bounce_endpoint, spec.udp_connect_dst);
        socks_base.add_rule(outbound, RuleClass::Socks, socks_base.len() + 1, &defaults, &NullIfNameResolver);
        if let Some(inbound) = inbound {
            socks_base.add_rule(inbound, RuleClass::Socks, socks_base.len() + 1, &defaults, &NullIfNameResolver);
        }
    }
    socks_base.validate_all(RuleClass::Socks)?;

    Ok(LoadedRules {
        client: client_base,
        hostid: load_rule_base(&hostid, RuleClass::Hostid, &defaults)?,
        socks: socks_base,
        defaults,
        udp_listen_addrs,
    })
}

pub fn config_dir() -> PathBuf {
    let strategy = choose_base_strategy().expect("unable to find the config directory");
    let mut path = strategy.config_dir();
    path.push("rsockd");
    path
}

pub fn cache_dir() -> PathBuf {
    let strategy = choose_base_strategy().expect("unable to find the cache directory");
    let mut path = strategy.cache_dir();
    path.push("rsockd");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_default_ruleset_parses_and_validates() {
        let loaded = load_rules(None).unwrap();
        assert!(loaded.socks.len() > 0);
    }

    #[test]
    fn user_rules_are_laid_in_front_of_the_built_in_tail() {
        let toml = r#"
            [[socks]]
            verdict = "block"
            dst_addr = "10.0.0.0/8"
        "#;
        let user: FileConfig = toml::from_str(toml).unwrap();
        let loaded = load_rules(Some(user)).unwrap();
        assert_eq!(loaded.socks.rules()[0].verdict, Verdict::Block);
    }

    #[test]
    fn cidr_and_dotted_quad_netmasks_parse_to_the_same_value() {
        let cidr = parse_addr("10.0.0.0/24").unwrap();
        let dotted = parse_addr("10.0.0.0/255.255.255.0").unwrap();
        assert_eq!(cidr, dotted);
    }

    #[test]
    fn range_port_spec_round_trips() {
        let port = parse_port("range 1024 65535").unwrap();
        assert_eq!(port.op, PortOp::Range);
        assert_eq!(port.tcp, 1024);
        assert_eq!(port.end, 65535);
    }

    #[test]
    fn udp_bounce_to_client_rule_synthesizes_socks_rules_and_a_listener() {
        let toml = r#"
            [[client]]
            verdict = "pass"
            protocols = ["udp"]
            bounce_to = "203.0.113.1:0"
            udp_connect_dst = true
        "#;
        let user: FileConfig = toml::from_str(toml).unwrap();
        let before = load_rules(None).unwrap().socks.len();
        let loaded = load_rules(Some(user)).unwrap();

        assert_eq!(loaded.socks.len(), before + 2);
        assert_eq!(
            loaded.udp_listen_addrs,
            vec!["203.0.113.1:0".parse::<std::net::SocketAddr>().unwrap()]
        );
        let synthesized = &loaded.socks.rules()[loaded.socks.len() - 2..];
        assert!(synthesized[0].state.commands.contains(&Command::UdpAssociate));
        assert!(synthesized[1].state.commands.contains(&Command::UdpReply));
    }
}
