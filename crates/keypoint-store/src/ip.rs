//! IP allow/block list matching.
//!
//! Entries come in three shapes:
//!
//! | Shape   | Example                     |
//! |---------|-----------------------------|
//! | Literal | `203.0.113.7`, `::1`        |
//! | CIDR    | `10.0.0.0/8`, `fe80::/10`   |
//! | Range   | `192.168.1.10-192.168.1.20` |
//!
//! IPv4-mapped IPv6 addresses (`::ffff:10.0.0.1`) are compared as IPv4.
//! Malformed entries never match anything.

use std::net::IpAddr;

/// Parse a request IP, unwrapping IPv4-mapped IPv6 addresses.
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    let ip: IpAddr = raw.trim().parse().ok()?;
    Some(normalize(ip))
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Check a single list entry against an address.
pub fn entry_matches(entry: &str, ip: IpAddr) -> bool {
    let entry = entry.trim();
    let ip = normalize(ip);

    if let Some((network, prefix)) = entry.split_once('/') {
        return cidr_matches(network, prefix, ip);
    }

    if let Some((start, end)) = entry.split_once('-') {
        return range_matches(start, end, ip);
    }

    parse_ip(entry).is_some_and(|literal| literal == ip)
}

/// Check whether `ip` (as received on the request) matches any entry.
///
/// Returns `false` when the request IP itself cannot be parsed.
pub fn matches_any<I, S>(entries: I, ip: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let Some(ip) = parse_ip(ip) else {
        return false;
    };
    entries
        .into_iter()
        .any(|entry| entry_matches(entry.as_ref(), ip))
}

fn cidr_matches(network: &str, prefix: &str, ip: IpAddr) -> bool {
    let (Some(network), Ok(prefix)) = (parse_ip(network), prefix.trim().parse::<u32>()) else {
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            if prefix > 32 {
                return false;
            }
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            if prefix > 128 {
                return false;
            }
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

fn range_matches(start: &str, end: &str, ip: IpAddr) -> bool {
    let (Some(start), Some(end)) = (parse_ip(start), parse_ip(end)) else {
        return false;
    };

    match (start, end, ip) {
        (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(addr)) => {
            (u32::from(s)..=u32::from(e)).contains(&u32::from(addr))
        }
        (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(addr)) => {
            (u128::from(s)..=u128::from(e)).contains(&u128::from(addr))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn literal_match() {
        assert!(entry_matches("203.0.113.7", ip("203.0.113.7")));
        assert!(!entry_matches("203.0.113.7", ip("203.0.113.8")));
        assert!(entry_matches("::1", ip("::1")));
    }

    #[test]
    fn cidr_v4() {
        assert!(entry_matches("10.0.0.0/8", ip("10.200.3.4")));
        assert!(!entry_matches("10.0.0.0/8", ip("11.0.0.1")));
        assert!(entry_matches("192.168.1.0/24", ip("192.168.1.255")));
        assert!(entry_matches("0.0.0.0/0", ip("8.8.8.8")));
        assert!(entry_matches("8.8.8.8/32", ip("8.8.8.8")));
    }

    #[test]
    fn cidr_v6() {
        assert!(entry_matches("fe80::/10", ip("fe80::1234")));
        assert!(!entry_matches("fe80::/10", ip("2001:db8::1")));
    }

    #[test]
    fn cidr_rejects_bad_prefix() {
        assert!(!entry_matches("10.0.0.0/33", ip("10.0.0.1")));
        assert!(!entry_matches("10.0.0.0/abc", ip("10.0.0.1")));
    }

    #[test]
    fn range_v4() {
        let entry = "192.168.1.10-192.168.1.20";
        assert!(entry_matches(entry, ip("192.168.1.10")));
        assert!(entry_matches(entry, ip("192.168.1.15")));
        assert!(entry_matches(entry, ip("192.168.1.20")));
        assert!(!entry_matches(entry, ip("192.168.1.21")));
    }

    #[test]
    fn mixed_families_never_match() {
        assert!(!entry_matches("10.0.0.0/8", ip("2001:db8::1")));
        assert!(!entry_matches("10.0.0.1-10.0.0.9", ip("::1")));
    }

    #[test]
    fn ipv4_mapped_addresses_compare_as_v4() {
        assert!(entry_matches("10.0.0.0/8", ip("::ffff:10.1.2.3")));
        assert!(matches_any(["127.0.0.1"], "::ffff:127.0.0.1"));
    }

    #[test]
    fn malformed_entries_and_ips() {
        assert!(!entry_matches("not-an-ip", ip("10.0.0.1")));
        assert!(!matches_any(["10.0.0.0/8"], "garbage"));
    }

    #[test]
    fn matches_any_over_list() {
        let list = vec!["1.1.1.1".to_string(), "10.0.0.0/8".to_string()];
        assert!(matches_any(&list, "10.9.9.9"));
        assert!(!matches_any(&list, "172.16.0.1"));
    }
}
