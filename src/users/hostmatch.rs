//! Client address vs grant-table host pattern matching.
//!
//! Grant-table host values come in four shapes: an address (possibly with
//! `%`/`_` wildcards), a `base_ip/netmask` pair, a hostname, or garbage.
//! The client address is likewise classified before matching so that the
//! expensive reverse name lookup only happens for hostname patterns.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use dashmap::DashMap;

const IPV4_MIN_LEN: usize = 7; // 1.1.1.1
const MAPPING_PREFIX: &str = ":ffff:";

/// Classification of a client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Ipv4,
    Ipv6,
    /// IPv4 mapped into IPv6, `::ffff:a.b.c.d`
    Mapped,
    Unknown,
}

/// Classification of a grant-table host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Literal address or an address-shaped wildcard pattern
    Address,
    /// `base_ip/netmask`, both IPv4
    Mask,
    /// DNS name, requires a reverse lookup of the client
    Hostname,
    Unknown,
}

/// Classify a client address.
pub fn parse_address_type(addr: &str) -> AddrType {
    if addr.parse::<Ipv4Addr>().is_ok() {
        return AddrType::Ipv4;
    }

    // The address could be IPv4 mapped to IPv6.
    if let Some(prefix_loc) = addr.find(MAPPING_PREFIX) {
        let ipv4_part = &addr[prefix_loc + MAPPING_PREFIX.len()..];
        if ipv4_part.len() >= IPV4_MIN_LEN && ipv4_part.parse::<Ipv4Addr>().is_ok() {
            return AddrType::Mapped;
        }
    }

    if addr.parse::<Ipv6Addr>().is_ok() {
        return AddrType::Ipv6;
    }
    AddrType::Unknown
}

/// Classify a host pattern.
///
/// A pattern may have wildcards, so the classification is an educated
/// guess: if the pattern can still be an address after scanning its
/// characters, it is taken as one. Being reasonably sure a pattern is not
/// a hostname lets matching skip the reverse name lookup.
pub fn parse_pattern_type(pattern: &str) -> PatternType {
    let is_wc = |c: char| c == '%' || c == '_';

    if pattern.parse::<Ipv4Addr>().is_ok() || pattern.parse::<Ipv6Addr>().is_ok() {
        // No wildcards, just an address.
        return PatternType::Address;
    }
    if pattern.chars().all(is_wc) {
        // Composed entirely of wildcards. Could be a hostname as well,
        // but that would only make a difference for a pattern like
        // "________" where the resolved hostname is of the right length
        // while the address is not.
        return PatternType::Address;
    }
    if is_mask_pattern(pattern) {
        return PatternType::Mask;
    }

    let mut maybe_address = true;
    let mut maybe_hostname = true;
    // '\' is an escape char to allow e.g. my_host.com to match properly.
    let mut escaped = false;

    fn classify_char(c: char, maybe_address: &mut bool, maybe_hostname: &mut bool) {
        if c == '%' || c == '_' {
            // Can be address or hostname.
            return;
        }
        if !(c.is_ascii_hexdigit() || c == ':' || c == '.') {
            *maybe_address = false;
        }
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
            *maybe_hostname = false;
        }
    }

    for c in pattern.chars() {
        if escaped {
            // % is not a valid escaped character.
            if c == '%' {
                maybe_address = false;
                maybe_hostname = false;
            } else {
                classify_char(c, &mut maybe_address, &mut maybe_hostname);
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            classify_char(c, &mut maybe_address, &mut maybe_hostname);
        }

        if !maybe_address && !maybe_hostname {
            return PatternType::Unknown;
        }
    }

    if maybe_address {
        // Address takes priority.
        PatternType::Address
    } else {
        PatternType::Hostname
    }
}

fn is_mask_pattern(pattern: &str) -> bool {
    match pattern.find('/') {
        Some(div) if div >= IPV4_MIN_LEN && pattern.len() > div + IPV4_MIN_LEN => {
            let base = &pattern[..div];
            let mask = &pattern[div + 1..];
            base.parse::<Ipv4Addr>().is_ok() && mask.parse::<Ipv4Addr>().is_ok()
        }
        _ => false,
    }
}

/// SQL LIKE with `%` matching any run, `_` matching one character and `\`
/// as the escape. ASCII-case-insensitive, iterative with backtracking.
pub fn sql_like(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    // On mismatch after a %, matching resumes one text character further
    // into the run the % swallowed.
    let mut pi = 0;
    let mut ti = 0;
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '%' => {
                    backtrack = Some((pi + 1, ti));
                    pi += 1;
                    continue;
                }
                '_' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {
                    let (c, width) = literal_at(&p, pi);
                    if c.eq_ignore_ascii_case(&t[ti]) {
                        pi += width;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        match backtrack {
            Some((star_pi, star_ti)) => {
                pi = star_pi;
                ti = star_ti + 1;
                backtrack = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

/// The literal character at `pi`, resolving the escape. A trailing lone
/// backslash stands for itself.
fn literal_at(p: &[char], pi: usize) -> (char, usize) {
    if p[pi] == '\\' && pi + 1 < p.len() {
        (p[pi + 1], 2)
    } else {
        (p[pi], 1)
    }
}

/// Does the client address match the host pattern?
///
/// Hostname patterns resolve the client through `dns`; a failed lookup is
/// a non-match, not an error. Unknown address or pattern shapes log a
/// throttled warning and never match.
pub fn address_matches_host_pattern(addr: &str, pattern: &str, dns: &ReverseDnsCache) -> bool {
    let addrtype = parse_address_type(addr);
    if addrtype == AddrType::Unknown {
        throttled_warn!("Client address '{}' is not supported.", addr);
        return false;
    }

    let patterntype = parse_pattern_type(pattern);
    match patterntype {
        PatternType::Address => {
            if sql_like(pattern, addr) {
                true
            } else if addrtype == AddrType::Mapped {
                // Try matching the ipv4-part of the address.
                sql_like(pattern, mapped_ipv4_part(addr))
            } else {
                false
            }
        }
        PatternType::Mask => {
            let effective_addr = match addrtype {
                AddrType::Ipv4 => addr,
                AddrType::Mapped => mapped_ipv4_part(addr),
                _ => return false,
            };
            mask_matches(effective_addr, pattern)
        }
        PatternType::Hostname => match dns.lookup(addr) {
            Some(resolved) => sql_like(pattern, &resolved),
            None => false,
        },
        PatternType::Unknown => {
            throttled_warn!("Host pattern '{}' is not supported.", pattern);
            false
        }
    }
}

fn mapped_ipv4_part(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(loc) => &addr[loc + 1..],
        None => addr,
    }
}

/// The pattern is of type `base_ip/mask`. The client ip is accepted if
/// `client_ip & mask == base_ip`, all three as 32-bit integers.
fn mask_matches(addr: &str, pattern: &str) -> bool {
    let div = match pattern.find('/') {
        Some(div) => div,
        None => return false,
    };
    match (
        ip_to_u32(addr),
        ip_to_u32(&pattern[..div]),
        ip_to_u32(&pattern[div + 1..]),
    ) {
        (Some(address), Some(base_ip), Some(mask)) => (address & mask) == base_ip,
        _ => false,
    }
}

fn ip_to_u32(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Specificity ranking: literal IPs beat CIDR masks beat hostname
/// literals beat wildcard patterns; among wildcards, fewer wildcard
/// characters wins; ties resolve lexicographically. The empty pattern
/// (role entries) sorts before everything.
pub fn pattern_is_more_specific(lhs: &str, rhs: &str) -> bool {
    (pattern_class(lhs), wildcard_count(lhs), lhs) < (pattern_class(rhs), wildcard_count(rhs), rhs)
}

fn pattern_class(pattern: &str) -> u8 {
    if pattern.is_empty() {
        0
    } else if pattern.parse::<Ipv4Addr>().is_ok() || pattern.parse::<Ipv6Addr>().is_ok() {
        1
    } else if is_mask_pattern(pattern) {
        2
    } else if wildcard_count(pattern) > 0 {
        4
    } else {
        3
    }
}

fn wildcard_count(pattern: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in pattern.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '%' || c == '_' {
            count += 1;
        }
    }
    count
}

/// Reverse-resolves an address to a hostname. Implementations must not
/// panic; failures are reported as `None`.
pub trait NameResolver: Send + Sync {
    fn reverse_lookup(&self, addr: IpAddr) -> Option<String>;
}

/// Resolver backed by the system resolver (getnameinfo).
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn reverse_lookup(&self, addr: IpAddr) -> Option<String> {
        dns_lookup::lookup_addr(&addr).ok()
    }
}

#[derive(Clone)]
struct CachedName {
    name: Option<String>,
    resolved_at: Instant,
}

/// TTL'd reverse-DNS cache.
///
/// Reverse lookups on the authentication path are a latency hazard, so
/// results are cached per address. Failed lookups are cached as negative
/// entries; an unresolvable client does not hammer the resolver on every
/// connection attempt.
pub struct ReverseDnsCache {
    resolver: Box<dyn NameResolver>,
    entries: DashMap<IpAddr, CachedName>,
    ttl: Duration,
}

impl ReverseDnsCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(resolver: Box<dyn NameResolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn with_system_resolver() -> Self {
        Self::new(Box::new(SystemResolver), Self::DEFAULT_TTL)
    }

    /// Resolve `addr` to a hostname through the cache.
    pub fn lookup(&self, addr: &str) -> Option<String> {
        let ip: IpAddr = addr.parse().ok()?;
        if let Some(hit) = self.entries.get(&ip) {
            if hit.resolved_at.elapsed() < self.ttl {
                return hit.name.clone();
            }
        }

        let name = self.resolver.reverse_lookup(ip);
        trace!("Resolved client address '{}' to {:?}.", addr, name);
        self.entries.insert(
            ip,
            CachedName {
                name: name.clone(),
                resolved_at: Instant::now(),
            },
        );
        name
    }
}

impl std::fmt::Debug for ReverseDnsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseDnsCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
