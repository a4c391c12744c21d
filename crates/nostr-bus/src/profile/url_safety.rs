//! URL checks for profile fields.
//!
//! Profile URLs come from other people's relays and end up rendered or
//! fetched by our own surfaces. Only public `https` hosts are accepted. The
//! check is lexical: literal IPs are classified, hostnames are matched
//! against reserved names, and nothing is resolved.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::Error;

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        // 0/8 "this network"
        || a == 0
        // 100.64/10 carrier-grade NAT
        || (a == 100 && (b & 0xC0) == 64)
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xFE00) == 0xFC00
        // fe80::/10 link-local
        || (first & 0xFFC0) == 0xFE80
        || embedded_v4(ip).is_some_and(|v4| is_private_v4(&v4))
}

/// IPv4 address carried in the low 32 bits of a mapped (`::ffff:a.b.c.d`),
/// compatible (`::a.b.c.d`) or NAT64 (`64:ff9b::a.b.c.d`) address.
fn embedded_v4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    let [_, _, _, _, _, _, _, _, _, _, _, _, a, b, c, d] = ip.octets();
    match ip.segments() {
        [0, 0, 0, 0, 0, 0xFFFF, _, _]
        | [0, 0, 0, 0, 0, 0, _, _]
        | [0x64, 0xFF9B, 0, 0, 0, 0, _, _] => Some(Ipv4Addr::new(a, b, c, d)),
        _ => None,
    }
}

fn is_reserved_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "local"
        || host.ends_with(".local")
}

/// Returns the reason a URL is unsafe, or `Ok(())`.
pub fn check_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid URL: {}", e))?;

    if url.scheme() != "https" {
        return Err(format!("scheme {} is not allowed", url.scheme()));
    }

    match url.host() {
        None => Err("URL must have a host".to_string()),
        Some(Host::Ipv4(ip)) if is_private_ip(&IpAddr::V4(ip)) => {
            Err(format!("{} is a private address", ip))
        }
        Some(Host::Ipv6(ip)) if is_private_ip(&IpAddr::V6(ip)) => {
            Err(format!("{} is a private address", ip))
        }
        Some(Host::Domain(domain)) if is_reserved_hostname(domain) => {
            Err(format!("{} is a local hostname", domain))
        }
        Some(_) => Ok(()),
    }
}

/// Like [`check_url`], tagged with the profile field it came from.
pub fn validate_url_safety(field: &'static str, raw: &str) -> Result<(), Error> {
    check_url(raw).map_err(|reason| Error::UnsafeUrl { field, reason })
}
