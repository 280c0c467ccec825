use std::collections::HashSet;

use proxy_auth::MethodKind;
use serde::{Deserialize, Serialize};

use crate::addr::{Endpoint, Protocol};

/// The operation a session is currently attempting (spec.md §3
/// `ConnectionState.command`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Accept,
    Bounceto,
    Hostid,
    Bind,
    Connect,
    UdpAssociate,
    BindReply,
    UdpReply,
}

impl Command {
    /// Commands a protocol implies when a rule sets `protocol` without an
    /// explicit `command` (spec.md §4.2 defaulting algorithm step 3).
    pub fn applicable_to(protocol: Protocol) -> &'static [Command] {
        match protocol {
            Protocol::Tcp => &[Command::Bind, Command::BindReply, Command::Connect],
            Protocol::Udp => &[Command::UdpAssociate, Command::UdpReply],
        }
    }

    /// Protocols a command implies when a rule sets `command` without an
    /// explicit `protocol` (spec.md §4.2 defaulting algorithm step 3,
    /// applied symmetrically).
    pub fn implies_protocol(self) -> Protocol {
        match self {
            Command::UdpAssociate | Command::UdpReply => Protocol::Udp,
            _ => Protocol::Tcp,
        }
    }

    pub fn is_reply_only(self) -> bool {
        matches!(self, Command::BindReply | Command::UdpReply)
    }
}

/// Proxy protocol version a session negotiated (spec.md §3
/// `ConnectionState.version`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    V4,
    V5,
    Http10,
    Http11,
}

/// Which rule base (spec.md §4.4 step 1) a lookup applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleClass {
    Client,
    Hostid,
    Socks,
}

impl RuleClass {
    pub fn for_command(command: Command) -> RuleClass {
        match command {
            Command::Accept | Command::Bounceto => RuleClass::Client,
            Command::Hostid => RuleClass::Hostid,
            _ => RuleClass::Socks,
        }
    }
}

/// The result of rule evaluation (spec.md GLOSSARY "Verdict").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Block,
}

/// Extension bits a request may turn on that a rule base can gate
/// (spec.md §3 `ConnectionState` "extension bitset, e.g. bind").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extensions {
    pub bind: bool,
}

/// Per-request progress state the rule engine is called with (spec.md
/// §3 "ConnectionState"). `hostid_chain` holds the upstream hostids
/// retrieved for the `Hostid` rule class (spec.md §4.4 step 4), capped
/// at `MAX_HOSTIDS`.
pub const MAX_HOSTIDS: usize = 8;

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub command: Command,
    pub protocol: Protocol,
    pub version: Version,
    pub extensions: Extensions,
    pub hostid_chain: Vec<u32>,
}

impl ConnectionState {
    pub fn new(command: Command, protocol: Protocol, version: Version) -> Self {
        Self {
            command,
            protocol,
            version,
            extensions: Extensions::default(),
            hostid_chain: Vec::new(),
        }
    }
}

/// A rule-bound hostid constraint: match at `index` (0 = any position)
/// against `ConnectionState::hostid_chain` (spec.md §3 "hostid with
/// index 0…N", GLOSSARY "Hostid").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdConstraint {
    pub hostid: u32,
    pub index: usize,
}

/// Which side of the relay a socket option applies to (spec.md §3
/// "socket-option list (each tagged internal- or external-side)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Internal,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOption {
    pub side: Side,
    pub name: String,
    pub value: i32,
}

/// Per-rule idle/connect timeout overrides (spec.md §4.4 step f "RFC931
/// ... timeout is set by the surrounding rule's timeout overrides", §5
/// "falling back to global defaults"). `None` means "use the global
/// default" for that phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timeouts {
    pub io_idle_secs: Option<u32>,
    pub negotiate_secs: Option<u32>,
    pub connect_secs: Option<u32>,
}

bitflags::bitflags! {
    /// Which events a matched rule asks to be logged (spec.md §3
    /// "log-flags").
    #[derive(Default, Serialize, Deserialize)]
    pub struct LogFlags: u8 {
        const CONNECT    = 0b0001;
        const DISCONNECT = 0b0010;
        const IOOP       = 0b0100;
        const ERROR      = 0b1000;
    }
}

/// Per-method parameters a rule may carry (spec.md §3 "plus per-method
/// parameters"). Only the fields relevant to method *selection* rather
/// than full backend configuration are kept here; GSSAPI/PAM backend
/// wiring itself is out of scope (spec.md §1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodParams {
    pub gssapi_servicename: Option<String>,
    pub gssapi_keytab: Option<String>,
    pub ldap_attribute: Option<String>,
}

/// The enabled-surface portion of a rule: commands, protocols,
/// versions, and the ordered method list (spec.md §3 "Rule.state").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleState {
    #[serde(default)]
    pub commands: HashSet<Command>,
    #[serde(default)]
    pub protocols: HashSet<Protocol>,
    #[serde(default)]
    pub versions: HashSet<Version>,
    #[serde(default)]
    pub methods: Vec<MethodKind>,
    #[serde(default)]
    pub method_params: MethodParams,
}

impl RuleState {
    pub fn allows_command(&self, command: Command) -> bool {
        self.commands.is_empty() || self.commands.contains(&command)
    }

    pub fn allows_protocol(&self, protocol: Protocol) -> bool {
        self.protocols.is_empty() || self.protocols.contains(&protocol)
    }

    pub fn allows_version(&self, version: Version) -> bool {
        self.versions.is_empty() || self.versions.contains(&version)
    }
}

/// A single ACL entry (spec.md §3 "Rule"). `number` is assigned by
/// [`crate::base::RuleBase::add_rule`] and is always `(index + 1)` of
/// its base — the slab-arena decision from spec.md §9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub number: usize,
    #[serde(default)]
    pub line: usize,
    pub verdict: Verdict,
    #[serde(default)]
    pub src: Endpoint,
    #[serde(default)]
    pub dst: Endpoint,
    #[serde(default)]
    pub rdr_from: Option<Endpoint>,
    #[serde(default)]
    pub rdr_to: Option<Endpoint>,
    #[serde(default)]
    pub hostid: Option<HostIdConstraint>,
    #[serde(default)]
    pub state: RuleState,
    #[serde(default)]
    pub user: Vec<String>,
    #[serde(default)]
    pub group: Vec<String>,
    #[serde(default)]
    pub ldap_group: Option<Vec<String>>,
    #[serde(default)]
    pub socket_options: Vec<SocketOption>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub libwrap_cmd: Option<String>,
    #[serde(default)]
    pub bandwidth_shmid: Option<u32>,
    #[serde(default)]
    pub sessioncount_shmid: Option<u32>,
    #[serde(default)]
    pub log_flags: LogFlags,
    /// True on the synthetic rule returned for "no rule matched"
    /// (spec.md §4.4 step 6) and for rule-engine-internal synthetic
    /// rules; never true for a rule appended via `add_rule`.
    #[serde(default)]
    pub synthetic: bool,
}

impl Rule {
    /// A bare, unvalidated rule with the given verdict and src/dst; all
    /// other fields take their `Default`/empty value. Callers append
    /// this through [`crate::base::RuleBase::add_rule`], which assigns
    /// `number`/`line` and runs the defaulting algorithm.
    pub fn new(verdict: Verdict, src: Endpoint, dst: Endpoint) -> Self {
        Self {
            number: 0,
            line: 0,
            verdict,
            src,
            dst,
            rdr_from: None,
            rdr_to: None,
            hostid: None,
            state: RuleState::default(),
            user: Vec::new(),
            group: Vec::new(),
            ldap_group: None,
            socket_options: Vec::new(),
            timeouts: Timeouts::default(),
            libwrap_cmd: None,
            bandwidth_shmid: None,
            sessioncount_shmid: None,
            log_flags: LogFlags::empty(),
            synthetic: false,
        }
    }

    /// The synthetic default-block sentinel (spec.md §4.4 step 6, §8
    /// "or the default-block sentinel").
    pub fn default_block() -> Self {
        let mut rule = Rule::new(Verdict::Block, Endpoint::any(), Endpoint::any());
        rule.synthetic = true;
        rule
    }

    pub fn requires_username(&self) -> bool {
        !self.user.is_empty() || !self.group.is_empty() || self.ldap_group.is_some()
    }
}
