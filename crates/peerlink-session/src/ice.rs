//! ICE candidate heuristics: address discovery and allow-list filtering.
//!
//! Filtering is deliberately a substring test on the raw candidate line, not a parse of
//! the candidate grammar. An allow-listed address or protocol only has to appear
//! somewhere in the line.

use std::collections::BTreeSet;
use std::sync::LazyLock;

static IPV4_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^(?:\d{1,3}\.){3}\d{1,3}$").unwrap());

/// First IPv4-looking token of a candidate line.
///
/// Tokens containing a `:` are IPv6-looking (including v4-mapped `::ffff:a.b.c.d`) and
/// are skipped.
pub fn extract_ipv4(candidate: &str) -> Option<&str> {
    candidate
        .split_whitespace()
        .filter(|token| !token.contains(':'))
        .find(|token| IPV4_REGEX.is_match(token))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateVerdict {
    Accept,
    /// Empty candidate line: the remote finished gathering.
    EndOfCandidates,
    FilteredByAddress,
    FilteredByProtocol,
}

/// Address and protocol allow-lists. An empty list allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateFilter {
    addresses: BTreeSet<String>,
    protocols: BTreeSet<String>,
}

impl CandidateFilter {
    pub fn new(
        addresses: impl IntoIterator<Item = impl Into<String>>,
        protocols: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut filter = Self::default();
        filter.set_addresses(addresses);
        filter.set_protocols(protocols);
        filter
    }

    pub fn set_addresses(&mut self, addresses: impl IntoIterator<Item = impl Into<String>>) {
        self.addresses = addresses
            .into_iter()
            .map(|a| -> String { a.into() })
            .filter(|a| !a.is_empty())
            .collect();
    }

    /// Protocols are matched case-insensitively.
    pub fn set_protocols(&mut self, protocols: impl IntoIterator<Item = impl Into<String>>) {
        self.protocols = protocols
            .into_iter()
            .map(|p| -> String { p.into() })
            .map(|p| p.to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
    }

    pub fn check(&self, candidate: &str) -> CandidateVerdict {
        if candidate.is_empty() {
            return CandidateVerdict::EndOfCandidates;
        }

        if !self.addresses.is_empty()
            && !self.addresses.iter().any(|addr| candidate.contains(addr.as_str()))
        {
            return CandidateVerdict::FilteredByAddress;
        }

        if !self.protocols.is_empty() {
            let lower = candidate.to_lowercase();
            if !self.protocols.iter().any(|proto| lower.contains(proto.as_str())) {
                return CandidateVerdict::FilteredByProtocol;
            }
        }

        CandidateVerdict::Accept
    }
}
