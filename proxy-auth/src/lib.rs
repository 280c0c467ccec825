use std::fmt;

use serde::{Deserialize, Serialize};

/// Authenticates a username/password pair at the SOCKS/HTTP wire boundary.
///
/// This is the narrow backend contract the negotiation stage uses once it
/// has already decided the method is username/password; it says nothing
/// about which method a rule requires, which is [`AuthMethod`]'s job.
pub trait Authenticator {
    fn authenticate(&self, user: &str, pass: &str) -> bool;
}

impl<T: Authenticator> Authenticator for &T {
    fn authenticate(&self, user: &str, pass: &str) -> bool {
        T::authenticate(self, user, pass)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Authentication {
    NoAuth,
    Basic(String, String),
}

impl Authenticator for Authentication {
    fn authenticate(&self, user: &str, pass: &str) -> bool {
        match self {
            Authentication::NoAuth => true,
            Authentication::Basic(u, p) => u == user && p == pass,
        }
    }
}

/// Identifies an authentication method without its payload.
///
/// Rules carry an ordered list of these (`state.methodv` in spec terms);
/// [`AuthState`] carries one together with whatever payload that method
/// needs for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    NotSet,
    None,
    Uname,
    Rfc931,
    Pam,
    BsdAuth,
    Gssapi,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MethodKind::NotSet => "notset",
            MethodKind::None => "none",
            MethodKind::Uname => "uname",
            MethodKind::Rfc931 => "rfc931",
            MethodKind::Pam => "pam",
            MethodKind::BsdAuth => "bsdauth",
            MethodKind::Gssapi => "gssapi",
        })
    }
}

/// Encryption negotiation flags carried by a GSSAPI method payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GssapiEncryption {
    pub nec: bool,
    pub clear: bool,
    pub integrity: bool,
    pub confidentiality: bool,
}

/// Tagged union of authentication methods and their payload. See spec
/// §3 "AuthMethod".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    NotSet,
    None,
    Uname { name: String, password: String },
    Rfc931 { name: String },
    Pam { name: String, password: String },
    BsdAuth { name: String, password: String },
    Gssapi {
        servicename: String,
        keytab: String,
        encryption: GssapiEncryption,
    },
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::NotSet
    }
}

impl AuthMethod {
    pub fn kind(&self) -> MethodKind {
        match self {
            AuthMethod::NotSet => MethodKind::NotSet,
            AuthMethod::None => MethodKind::None,
            AuthMethod::Uname { .. } => MethodKind::Uname,
            AuthMethod::Rfc931 { .. } => MethodKind::Rfc931,
            AuthMethod::Pam { .. } => MethodKind::Pam,
            AuthMethod::BsdAuth { .. } => MethodKind::BsdAuth,
            AuthMethod::Gssapi { .. } => MethodKind::Gssapi,
        }
    }

    /// The username this method can vouch for, if any. Used by the rule
    /// engine's user/group binding check (spec §4.4 step g).
    pub fn username(&self) -> Option<&str> {
        match self {
            AuthMethod::Uname { name, .. }
            | AuthMethod::Rfc931 { name }
            | AuthMethod::Pam { name, .. }
            | AuthMethod::BsdAuth { name, .. } => Some(name.as_str()),
            AuthMethod::NotSet | AuthMethod::None | AuthMethod::Gssapi { .. } => None,
        }
    }
}

/// Per-session authentication record (spec §3 / C3).
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub method: AuthMethod,
}

impl AuthState {
    pub fn new(method: AuthMethod) -> Self {
        Self { method }
    }

    pub fn kind(&self) -> MethodKind {
        self.method.kind()
    }

    /// Lossy conversion of whatever credentials the current method already
    /// carries into a different method's payload. See spec §4.3.
    ///
    /// - `Uname` -> `Pam` (copy name & password) or `BsdAuth` (copy name, empty password)
    /// - `Rfc931` -> `Pam`/`BsdAuth` (copy name, empty password)
    /// - `NotSet`/`None` -> `Pam` (empty name & password)
    pub fn copy_payload_for(&self, new_kind: MethodKind) -> Option<AuthMethod> {
        match (&self.method, new_kind) {
            (AuthMethod::Uname { name, password }, MethodKind::Pam) => Some(AuthMethod::Pam {
                name: name.clone(),
                password: password.clone(),
            }),
            (AuthMethod::Uname { name, .. }, MethodKind::BsdAuth) => Some(AuthMethod::BsdAuth {
                name: name.clone(),
                password: String::new(),
            }),
            (AuthMethod::Rfc931 { name }, MethodKind::Pam) => Some(AuthMethod::Pam {
                name: name.clone(),
                password: String::new(),
            }),
            (AuthMethod::Rfc931 { name }, MethodKind::BsdAuth) => Some(AuthMethod::BsdAuth {
                name: name.clone(),
                password: String::new(),
            }),
            (AuthMethod::NotSet | AuthMethod::None, MethodKind::Pam) => Some(AuthMethod::Pam {
                name: String::new(),
                password: String::new(),
            }),
            _ => None,
        }
    }
}

/// Already-collected credentials the upgrade procedure may draw on without
/// performing new I/O. Synchronous lookups (ident, PAM) are performed by
/// the caller before populating this and are not retried inside
/// [`upgrade`]; `upgrade` itself never blocks.
#[derive(Debug, Clone, Default)]
pub struct UpgradeContext {
    /// RFC931 (ident) username, if a lookup has already been performed
    /// (either for this request or reused from the client's prior auth).
    pub ident_name: Option<String>,
    /// Username/password already supplied by the client (e.g. during
    /// SOCKSv5 negotiation), available for Pam/BsdAuth/Uname upgrade.
    pub uname: Option<(String, String)>,
    /// Whether GSSAPI establishment is permitted for the current command.
    /// Spec §9 open question: only true for `Command::Accept`.
    pub gssapi_allowed: bool,
}

/// Attempt to find a method, in `precedence` order, that both appears in
/// `allowed` (the rule's method list) and whose credentials can be
/// synthesized from `current` and `ctx` without new I/O. Returns the
/// first method that becomes *checkable* (spec §4.4 step 5f), or `None`
/// if no rule method is reachable.
///
/// This never lowers security: the result is either `current` unchanged
/// or one of the methods listed in `allowed`.
pub fn upgrade(
    current: &AuthState,
    precedence: &[MethodKind],
    allowed: &[MethodKind],
    ctx: &UpgradeContext,
) -> Option<AuthMethod> {
    if allowed.contains(&current.kind()) {
        return Some(current.method.clone());
    }

    for candidate in precedence {
        if !allowed.contains(candidate) {
            continue;
        }

        match candidate {
            MethodKind::None => return Some(AuthMethod::None),
            MethodKind::Rfc931 => {
                if let Some(name) = &ctx.ident_name {
                    return Some(AuthMethod::Rfc931 { name: name.clone() });
                }
            }
            MethodKind::Pam | MethodKind::BsdAuth => {
                if let Some(payload) = current.copy_payload_for(*candidate) {
                    return Some(payload);
                }
                if let Some((u, p)) = &ctx.uname {
                    return Some(if *candidate == MethodKind::Pam {
                        AuthMethod::Pam {
                            name: u.clone(),
                            password: p.clone(),
                        }
                    } else {
                        AuthMethod::BsdAuth {
                            name: u.clone(),
                            password: p.clone(),
                        }
                    });
                }
            }
            MethodKind::Uname => {
                if let Some((u, p)) = &ctx.uname {
                    return Some(AuthMethod::Uname {
                        name: u.clone(),
                        password: p.clone(),
                    });
                }
            }
            MethodKind::Gssapi => {
                if ctx.gssapi_allowed {
                    return Some(AuthMethod::Gssapi {
                        servicename: String::new(),
                        keytab: String::new(),
                        encryption: GssapiEncryption::default(),
                    });
                }
            }
            MethodKind::NotSet => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_prefers_current_method_if_already_allowed() {
        let current = AuthState::new(AuthMethod::None);
        let got = upgrade(
            &current,
            &[MethodKind::Rfc931, MethodKind::None],
            &[MethodKind::None],
            &UpgradeContext::default(),
        );
        assert_eq!(got, Some(AuthMethod::None));
    }

    #[test]
    fn upgrade_to_rfc931_requires_ident_name() {
        let current = AuthState::new(AuthMethod::NotSet);
        let no_name = upgrade(
            &current,
            &[MethodKind::Rfc931],
            &[MethodKind::Rfc931],
            &UpgradeContext::default(),
        );
        assert_eq!(no_name, None);

        let ctx = UpgradeContext {
            ident_name: Some("alice".to_string()),
            ..Default::default()
        };
        let got = upgrade(&current, &[MethodKind::Rfc931], &[MethodKind::Rfc931], &ctx);
        assert_eq!(
            got,
            Some(AuthMethod::Rfc931 {
                name: "alice".to_string()
            })
        );
    }

    #[test]
    fn upgrade_never_returns_method_outside_allowed_or_current() {
        let current = AuthState::new(AuthMethod::Uname {
            name: "bob".into(),
            password: "secret".into(),
        });
        let ctx = UpgradeContext::default();
        let got = upgrade(
            &current,
            &[MethodKind::Pam, MethodKind::BsdAuth],
            &[MethodKind::Pam],
            &ctx,
        );
        assert_eq!(
            got,
            Some(AuthMethod::Pam {
                name: "bob".into(),
                password: "secret".into()
            })
        );
    }

    #[test]
    fn gssapi_upgrade_gated_by_context_flag() {
        let current = AuthState::new(AuthMethod::NotSet);
        let denied = upgrade(
            &current,
            &[MethodKind::Gssapi],
            &[MethodKind::Gssapi],
            &UpgradeContext::default(),
        );
        assert_eq!(denied, None);

        let ctx = UpgradeContext {
            gssapi_allowed: true,
            ..Default::default()
        };
        let allowed = upgrade(&current, &[MethodKind::Gssapi], &[MethodKind::Gssapi], &ctx);
        assert!(matches!(allowed, Some(AuthMethod::Gssapi { .. })));
    }
}
