//! Request scoping: which requests the gateway handles at all.

use tracing::trace;
use url::{Origin, Url};

/// Type of host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact host match.
    Exact,
    /// Host or any subdomain of it.
    Suffix,
}

/// Host pattern from the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Lowercased host, without the `*.` prefix.
    pub pattern: String,
}

impl HostPattern {
    /// Create an exact match pattern.
    pub fn exact(host: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: host.to_ascii_lowercase(),
        }
    }

    /// Create a suffix match pattern (the domain and its subdomains).
    pub fn suffix(domain: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: domain.to_ascii_lowercase(),
        }
    }

    /// Parse an allow-list entry: `*.example.com` or `fonts.example.com`.
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        match entry.strip_prefix("*.") {
            Some(domain) => Self::suffix(domain),
            None => Self::exact(entry),
        }
    }

    /// Check if a host matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => host == self.pattern,
            PatternType::Suffix => {
                host == self.pattern
                    || host
                        .strip_suffix(self.pattern.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
        }
    }
}

/// Outcome of scoping a request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    /// Same origin as the scope.
    SameOrigin,
    /// Cross-origin host on the allow-list.
    AllowListed,
    /// Not handled; the request goes to the network untouched.
    OutOfScope,
}

impl ScopeDecision {
    pub fn is_handled(&self) -> bool {
        !matches!(self, ScopeDecision::OutOfScope)
    }
}

/// Decides which request URLs the gateway intercepts.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    origin: Origin,
    allowed: Vec<HostPattern>,
}

impl ScopeFilter {
    /// Create a filter for `scope` with an allow-list of external hosts.
    pub fn new<S: AsRef<str>>(scope: &Url, allowed_hosts: &[S]) -> Self {
        Self {
            origin: scope.origin(),
            allowed: allowed_hosts
                .iter()
                .map(|h| h.as_ref())
                .filter(|h| !h.trim().is_empty())
                .map(HostPattern::parse)
                .collect(),
        }
    }

    /// Allow-listed patterns.
    pub fn allowed(&self) -> &[HostPattern] {
        &self.allowed
    }

    /// Classify a request URL.
    pub fn classify(&self, url: &Url) -> ScopeDecision {
        if url.origin() == self.origin {
            return ScopeDecision::SameOrigin;
        }

        let Some(host) = url.host_str() else {
            return ScopeDecision::OutOfScope;
        };

        if let Some(pattern) = self.allowed.iter().find(|p| p.matches(host)) {
            trace!(url = %url, pattern = %pattern.pattern, "Allow-listed external request");
            return ScopeDecision::AllowListed;
        }

        ScopeDecision::OutOfScope
    }
}
