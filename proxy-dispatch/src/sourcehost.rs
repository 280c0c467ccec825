//! Concrete reverse-DNS source-host check (spec.md C9, §4.9).
//!
//! `nodnsunknown`/`nodnsmismatch` in a rule's log flags are out of this
//! crate's scope (that's rule-base configuration), but the check itself
//! needs a real resolver: the workspace's only other DNS facility is
//! `tokio::net::lookup_host`, which is forward-only and cannot answer
//! "does this IP's PTR record resolve back to itself". `hickory-resolver`
//! is already used for exactly this in other proxy tooling in the wider
//! example pack, so it's what this pulls in.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use proxy_io::SocksHost;
use proxy_rules::SourceHostCheck;

/// Resolves the connecting client's PTR record and confirms the forward
/// lookup of that name includes the original address back (spec.md §4.9
/// "a host whose reverse lookup fails, or whose forward-confirm does not
/// include the original address, fails the check").
pub struct ReverseDnsSourceHostCheck {
    resolver: TokioAsyncResolver,
}

impl ReverseDnsSourceHostCheck {
    pub fn from_system_config() -> Result<Self, hickory_resolver::error::ResolveError> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl SourceHostCheck for ReverseDnsSourceHostCheck {
    async fn check(&self, src: &SocksHost) -> bool {
        let Some(ip) = src.ip() else {
            // A bare hostname source has nothing to reverse-resolve;
            // treat it as already-named and let the rule's own
            // constraints decide whether that's acceptable.
            return true;
        };

        let names = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup,
            Err(_) => return false,
        };

        for name in names.iter() {
            let Ok(forward) = self.resolver.lookup_ip(name.to_utf8()).await else {
                continue;
            };
            if forward.iter().any(|resolved| resolved == ip) {
                return true;
            }
        }
        false
    }
}

/// A check that only ever consults the forward direction: given a name
/// already associated with the session (e.g. because the client
/// authenticated via a method that names the peer), confirms that name's
/// forward lookup includes `src`'s address. Used where a reverse zone is
/// not delegated but a ident/PAM backend has already supplied a name.
pub struct ForwardConfirmSourceHostCheck {
    resolver: TokioAsyncResolver,
    claimed_name: String,
}

impl ForwardConfirmSourceHostCheck {
    pub fn new(resolver: TokioAsyncResolver, claimed_name: String) -> Self {
        Self {
            resolver,
            claimed_name,
        }
    }
}

#[async_trait]
impl SourceHostCheck for ForwardConfirmSourceHostCheck {
    async fn check(&self, src: &SocksHost) -> bool {
        let Some(ip) = src.ip() else {
            return false;
        };
        match self.resolver.lookup_ip(self.claimed_name.as_str()).await {
            Ok(lookup) => lookup.iter().any(|resolved| resolved == ip),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    // Exercising `ReverseDnsSourceHostCheck` needs a live resolver and
    // real PTR/forward records, so it is covered by the permissive and
    // always-fail stand-ins already unit-tested in proxy-rules::engine;
    // this module is grounded there rather than re-testing DNS I/O.
}
