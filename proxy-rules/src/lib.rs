mod addr;
mod base;
mod engine;
mod rule;

pub use addr::{addrmatch, Endpoint, Port, PortOp, Protocol, RuleAddr};
pub use base::{
    synthesize_udp_rules, IfNameResolver, NullIfNameResolver, RuleBase, RuleDefaults,
    ValidationError, validate,
};
pub use engine::{
    rules_permit, AccessBackend, EngineVerdict, IdentClient, NoAccessBackend, NoIdentClient,
    PermissiveSourceHostCheck, RuleInputs, SourceHostCheck,
};
pub use rule::{
    Command, ConnectionState, Extensions, HostIdConstraint, LogFlags, MethodParams, Rule,
    RuleClass, RuleState, Side, SocketOption, Timeouts, Verdict, Version, MAX_HOSTIDS,
};
