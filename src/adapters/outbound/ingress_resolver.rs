//! Ingress Rule Resolver
//!
//! Static `hostname=service` rules, matched first to last.
//!
//! Hostname patterns:
//! - `app.example.com` exact (case-insensitive)
//! - `*.example.com` any subdomain of `example.com`
//! - `*` catch-all
//!
//! Services:
//! - `http://host:port` and `ws://host:port` dial an HTTP/1.1 origin
//! - `tcp://host:port` dials a raw TCP origin
//! - `http_status:CODE` answers with `CODE` without dialing

use crate::domain::entities::OriginTarget;
use crate::domain::ports::{OriginEndpoint, OriginResolver, ResolveError};
use anyhow::{anyhow, bail};

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    Suffix(String),
    Any,
}

impl HostPattern {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.is_empty() {
            bail!("empty hostname pattern");
        }
        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(suffix) = raw.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                bail!("bad wildcard pattern {:?}", raw);
            }
            return Ok(Self::Suffix(format!(".{}", suffix)));
        }
        if raw.contains('*') {
            bail!("wildcard only allowed as leading label: {:?}", raw);
        }
        Ok(Self::Exact(raw))
    }

    fn matches(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(name) => *name == hostname,
            Self::Suffix(suffix) => hostname.len() > suffix.len() && hostname.ends_with(suffix.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pattern: HostPattern,
    endpoint: OriginEndpoint,
}

impl IngressRule {
    /// Parse one `hostname=service` rule.
    pub fn parse(rule: &str) -> anyhow::Result<Self> {
        let (host, service) = rule
            .split_once('=')
            .ok_or_else(|| anyhow!("ingress rule {:?} is not hostname=service", rule))?;

        Ok(Self {
            pattern: HostPattern::parse(host)?,
            endpoint: parse_service(service.trim())?,
        })
    }

    pub fn endpoint(&self) -> &OriginEndpoint {
        &self.endpoint
    }
}

fn parse_service(service: &str) -> anyhow::Result<OriginEndpoint> {
    if let Some(code) = service.strip_prefix("http_status:") {
        let code: u16 = code
            .parse()
            .map_err(|_| anyhow!("bad status in service {:?}", service))?;
        if !(100..1000).contains(&code) {
            bail!("status {} out of range", code);
        }
        return Ok(OriginEndpoint::Status(code));
    }

    let (scheme, addr) = service
        .split_once("://")
        .ok_or_else(|| anyhow!("service {:?} has no scheme", service))?;
    let addr = addr.trim_end_matches('/');
    if addr.is_empty() || !addr.contains(':') {
        bail!("service {:?} needs host:port", service);
    }

    match scheme {
        "http" | "ws" => Ok(OriginEndpoint::Http {
            addr: addr.to_string(),
        }),
        "tcp" => Ok(OriginEndpoint::Tcp {
            addr: addr.to_string(),
        }),
        other => bail!("unsupported service scheme {:?}", other),
    }
}

/// Ordered ingress rules.
#[derive(Debug, Clone, Default)]
pub struct IngressResolver {
    rules: Vec<IngressRule>,
}

impl IngressResolver {
    pub fn new(rules: Vec<IngressRule>) -> Self {
        Self { rules }
    }

    /// Parse a comma-separated rule list.
    pub fn parse(list: &str) -> anyhow::Result<Self> {
        let rules = list
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(IngressRule::parse)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl OriginResolver for IngressResolver {
    fn resolve(&self, target: &OriginTarget) -> Result<OriginEndpoint, ResolveError> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(&target.hostname))
            .map(|rule| rule.endpoint.clone())
            .ok_or_else(|| ResolveError::NoMatchingOrigin(target.hostname.clone()))
    }
}
