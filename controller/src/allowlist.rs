//! # Agent IP Allow-Lists
//!
//! Each agent record carries an ordered list of allow-list entries checked
//! against the peer address during the handshake. An entry is a literal
//! IPv4/IPv6 address, a CIDR range, or the wildcard `*`.
//!
//! An empty list rejects every peer. Agents must opt in to connectivity
//! explicitly, typically with `*` for lab setups.

use ipnet::IpNet;
use std::net::IpAddr;

/// Checks one allow-list entry for syntactic validity at mutation time.
pub fn validate_entry(entry: &str) -> Result<(), String> {
    if entry == "*" {
        return Ok(());
    }
    if entry.parse::<IpAddr>().is_ok() || entry.parse::<IpNet>().is_ok() {
        return Ok(());
    }
    Err(format!(
        "invalid allow-list entry {entry:?}: expected an IP address, CIDR range, or '*'"
    ))
}

/// True iff `ip` matches at least one entry. An empty list rejects all.
pub fn ip_allowed(ip: IpAddr, entries: &[String]) -> bool {
    entries.iter().any(|entry| entry_matches(ip, entry))
}

fn entry_matches(ip: IpAddr, entry: &str) -> bool {
    if entry == "*" {
        return true;
    }
    if let Ok(literal) = entry.parse::<IpAddr>() {
        return literal == ip;
    }
    if let Ok(net) = entry.parse::<IpNet>() {
        return net.contains(&ip);
    }
    // Unparseable entries never match; they are rejected at write time.
    false
}
