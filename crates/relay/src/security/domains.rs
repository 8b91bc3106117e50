//! Domain allow/blocklist evaluation.
//!
//! Matching is on the parsed hostname: an entry matches when the hostname
//! equals it or ends with `.{entry}`. Substring containment is never used;
//! `evil-github.com` must not pass a `github.com` allowlist, and a
//! `chrome://` blocklist entry must not be dodged by `notchrome://` lookalike
//! schemes. Entries ending in `://` match on the URL scheme instead.

use url::Url;

use tabpilot_core::{BlockReason, DomainsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainVerdict {
    Allowed,
    Blocked(BlockReason),
}

/// Evaluate a target URL against the configured lists. The blocklist wins
/// unconditionally; a non-empty allowlist then requires a match; an empty
/// allowlist admits everything the blocklist did not reject.
pub fn evaluate_url(raw_url: &str, domains: &DomainsConfig) -> DomainVerdict {
    let parsed = match Url::parse(raw_url) {
        Ok(url) => url,
        // An unparseable target cannot be vetted, so it does not pass.
        Err(_) => return DomainVerdict::Blocked(BlockReason::DomainBlocked),
    };
    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed.host_str().map(|h| h.to_ascii_lowercase());

    for entry in &domains.blocklist {
        if entry_matches(entry, &scheme, host.as_deref()) {
            return DomainVerdict::Blocked(BlockReason::DomainBlocked);
        }
    }

    if domains.allowlist.is_empty() {
        return DomainVerdict::Allowed;
    }
    for entry in &domains.allowlist {
        if entry_matches(entry, &scheme, host.as_deref()) {
            return DomainVerdict::Allowed;
        }
    }
    DomainVerdict::Blocked(BlockReason::NotAllowlisted)
}

fn entry_matches(entry: &str, scheme: &str, host: Option<&str>) -> bool {
    let entry = entry.trim().to_ascii_lowercase();
    if entry.is_empty() {
        return false;
    }
    if let Some(entry_scheme) = entry.strip_suffix("://") {
        return scheme == entry_scheme;
    }
    match host {
        Some(host) => host == entry || host.ends_with(&format!(".{entry}")),
        None => false,
    }
}
