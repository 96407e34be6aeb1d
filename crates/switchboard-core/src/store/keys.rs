//! Key layout for persisted health state.
//!
//! Keys are `{kind}:{network}:{url}`. Network names never contain `:` (enforced by
//! configuration validation) while urls usually do, so decoding splits on the first `:`
//! after the kind prefix.

use std::fmt;

/// The kind of state a key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Passive-failure penalty; its expiry restores the endpoint's rating.
    Rating,
    /// Consecutive probe failures.
    Fail,
    /// Consecutive probe successes while penalized.
    Success,
    /// Cluster-wide lease held by the process currently probing an endpoint.
    Probe,
}

impl KeyKind {
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Rating => "rating",
            Self::Fail => "fail",
            Self::Success => "success",
            Self::Probe => "probe",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "rating" => Some(Self::Rating),
            "fail" => Some(Self::Fail),
            "success" => Some(Self::Success),
            "probe" => Some(Self::Probe),
            _ => None,
        }
    }
}

/// A decoded store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub kind: KeyKind,
    pub network: String,
    pub url: String,
}

impl StoreKey {
    #[must_use]
    pub fn new(kind: KeyKind, network: impl Into<String>, url: impl Into<String>) -> Self {
        Self { kind, network: network.into(), url: url.into() }
    }

    #[must_use]
    pub fn rating(network: &str, url: &str) -> Self {
        Self::new(KeyKind::Rating, network, url)
    }

    #[must_use]
    pub fn fail(network: &str, url: &str) -> Self {
        Self::new(KeyKind::Fail, network, url)
    }

    #[must_use]
    pub fn success(network: &str, url: &str) -> Self {
        Self::new(KeyKind::Success, network, url)
    }

    #[must_use]
    pub fn probe(network: &str, url: &str) -> Self {
        Self::new(KeyKind::Probe, network, url)
    }

    /// Parses a raw key. Returns `None` for keys outside this layout.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        let (prefix, rest) = raw.split_once(':')?;
        let kind = KeyKind::from_prefix(prefix)?;
        let (network, url) = rest.split_once(':')?;
        if network.is_empty() || url.is_empty() {
            return None;
        }
        Some(Self::new(kind, network, url))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.prefix(), self.network, self.url)
    }
}
