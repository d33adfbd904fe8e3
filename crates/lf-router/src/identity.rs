//! Local host identity.

use std::sync::Arc;

use crate::error::ResolveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Short name, up to the first dot.
    pub hostname: Arc<str>,
    pub fqdn: Arc<str>,
}

impl HostIdentity {
    pub fn from_fqdn(fqdn: &str) -> Self {
        let short = fqdn.split('.').next().filter(|s| !s.is_empty()).unwrap_or(fqdn);
        Self {
            hostname: Arc::from(short),
            fqdn: Arc::from(fqdn),
        }
    }
}

pub trait HostResolver: Send + Sync {
    fn resolve(&self) -> Result<HostIdentity, ResolveError>;
}

/// Resolves the local host from a configured override, `$HOSTNAME`, or the
/// kernel host name, in that order.
#[derive(Debug, Clone, Default)]
pub struct SystemHostResolver {
    configured: Option<String>,
}

impl SystemHostResolver {
    pub fn new(configured: Option<String>) -> Self {
        Self {
            configured: configured.filter(|name| !name.trim().is_empty()),
        }
    }
}

impl HostResolver for SystemHostResolver {
    fn resolve(&self) -> Result<HostIdentity, ResolveError> {
        if let Some(name) = &self.configured {
            return Ok(HostIdentity::from_fqdn(name.trim()));
        }
        if let Some(name) = std::env::var("HOSTNAME").ok().filter(|n| !n.trim().is_empty()) {
            return Ok(HostIdentity::from_fqdn(name.trim()));
        }
        match std::fs::read_to_string("/proc/sys/kernel/hostname") {
            Ok(name) if !name.trim().is_empty() => Ok(HostIdentity::from_fqdn(name.trim())),
            Ok(_) => Err(ResolveError::new("local host", "kernel host name is empty")),
            Err(e) => Err(ResolveError::new("local host", e.to_string())),
        }
    }
}
