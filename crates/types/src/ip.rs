use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Errors raised when parsing or manipulating IP ranges.
#[derive(Debug, thiserror::Error)]
pub enum IpRangeError {
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
    #[error("prefix length must be <= 32, got {0}")]
    InvalidPrefix(u8),
    #[error("range start {start} exceeds end {end}")]
    InvertedBounds { start: u32, end: u32 },
}

/// An inclusive range of IPv4 addresses, stored as host-order integers.
///
/// Ranges are the unit of value in the ledger: transactions move ranges
/// between accounts rather than scalar amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpRange {
    pub start: u32,
    pub end: u32,
}

impl IpRange {
    pub fn new(start: u32, end: u32) -> Result<Self, IpRangeError> {
        if start > end {
            return Err(IpRangeError::InvertedBounds { start, end });
        }
        Ok(IpRange { start, end })
    }

    /// Parse CIDR notation such as `10.0.0.0/24` into an inclusive range.
    pub fn from_cidr(cidr: &str) -> Result<Self, IpRangeError> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| IpRangeError::InvalidCidr(cidr.to_string()))?;
        let base: Ipv4Addr = addr
            .parse()
            .map_err(|_| IpRangeError::InvalidCidr(cidr.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| IpRangeError::InvalidCidr(cidr.to_string()))?;
        if prefix > 32 {
            return Err(IpRangeError::InvalidPrefix(prefix));
        }
        let base = u32::from(base);
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let start = base & mask;
        let end = start | !mask;
        Ok(IpRange { start, end })
    }

    /// Number of addresses covered by this range.
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false // an inclusive range always covers at least one address
    }

    pub fn contains_addr(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }

    pub fn contains_range(&self, other: &IpRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &IpRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Remove `other` from this range, returning the remainders (zero, one,
    /// or two ranges). `other` must be fully contained in `self`.
    pub fn minus(&self, other: &IpRange) -> Vec<IpRange> {
        debug_assert!(self.contains_range(other));
        let mut out = Vec::with_capacity(2);
        if other.start > self.start {
            out.push(IpRange {
                start: self.start,
                end: other.start - 1,
            });
        }
        if other.end < self.end {
            out.push(IpRange {
                start: other.end + 1,
                end: self.end,
            });
        }
        out
    }
}

impl std::fmt::Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            Ipv4Addr::from(self.start),
            Ipv4Addr::from(self.end)
        )
    }
}

/// The structured balance of an account: the IP ranges it owns, has
/// delegated away, and has received by delegation, plus its LISP map-server
/// and locator designations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBalance {
    pub own_ips: Vec<IpRange>,
    pub delegated_ips: Vec<IpRange>,
    pub received_ips: Vec<IpRange>,
    pub map_server: Option<Ipv4Addr>,
    pub locator: Option<Ipv4Addr>,
}

impl IpBalance {
    pub fn is_empty(&self) -> bool {
        self.own_ips.is_empty()
            && self.delegated_ips.is_empty()
            && self.received_ips.is_empty()
            && self.map_server.is_none()
            && self.locator.is_none()
    }

    /// Total number of addresses in owned ranges. Used as the weight in
    /// signer rotation.
    pub fn owned_count(&self) -> u64 {
        self.own_ips.iter().map(IpRange::len).sum()
    }

    /// True when some owned range fully covers `range`.
    pub fn holds_own(&self, range: &IpRange) -> bool {
        self.own_ips.iter().any(|r| r.contains_range(range))
    }

    pub fn add_own(&mut self, range: IpRange) {
        self.own_ips.push(range);
        normalize(&mut self.own_ips);
    }

    /// Carve `range` out of the owned set. Returns false (leaving the set
    /// untouched) when no owned range covers it.
    pub fn remove_own(&mut self, range: &IpRange) -> bool {
        let Some(pos) = self.own_ips.iter().position(|r| r.contains_range(range)) else {
            return false;
        };
        let holder = self.own_ips.remove(pos);
        self.own_ips.extend(holder.minus(range));
        normalize(&mut self.own_ips);
        true
    }

    pub fn add_delegated(&mut self, range: IpRange) {
        self.delegated_ips.push(range);
        normalize(&mut self.delegated_ips);
    }

    pub fn add_received(&mut self, range: IpRange) {
        self.received_ips.push(range);
        normalize(&mut self.received_ips);
    }

    /// Find the owned range covering `addr`, if any.
    pub fn covering_own(&self, addr: u32) -> Option<&IpRange> {
        self.own_ips.iter().find(|r| r.contains_addr(addr))
    }
}

/// Sort ranges and merge any that touch or overlap, so that the encoded
/// form of a balance is canonical.
fn normalize(ranges: &mut Vec<IpRange>) {
    if ranges.len() < 2 {
        return;
    }
    ranges.sort();
    let mut merged: Vec<IpRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if u64::from(range.start) <= u64::from(last.end) + 1 => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> IpRange {
        IpRange::from_cidr(s).unwrap()
    }

    #[test]
    fn cidr_parsing() {
        let r = cidr("10.0.0.0/24");
        assert_eq!(r.start, u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(r.end, u32::from(Ipv4Addr::new(10, 0, 0, 255)));
        assert_eq!(r.len(), 256);
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!(IpRange::from_cidr("10.0.0.0").is_err());
        assert!(IpRange::from_cidr("10.0.0.0/33").is_err());
        assert!(IpRange::from_cidr("not-an-ip/8").is_err());
    }

    #[test]
    fn minus_splits_range() {
        let outer = cidr("10.0.0.0/24");
        let inner = cidr("10.0.0.64/26");
        let rest = outer.minus(&inner);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].end + 1, inner.start);
        assert_eq!(rest[1].start - 1, inner.end);
        assert_eq!(rest[0].len() + rest[1].len() + inner.len(), outer.len());
    }

    #[test]
    fn remove_own_carves_and_rejects() {
        let mut bal = IpBalance::default();
        bal.add_own(cidr("10.0.0.0/24"));
        assert!(bal.remove_own(&cidr("10.0.0.0/25")));
        assert!(!bal.holds_own(&cidr("10.0.0.0/25")));
        assert!(bal.holds_own(&cidr("10.0.0.128/25")));
        // not covered anymore
        assert!(!bal.remove_own(&cidr("10.0.0.0/25")));
    }

    #[test]
    fn normalize_merges_adjacent() {
        let mut bal = IpBalance::default();
        bal.add_own(cidr("10.0.0.0/25"));
        bal.add_own(cidr("10.0.0.128/25"));
        assert_eq!(bal.own_ips.len(), 1);
        assert_eq!(bal.own_ips[0], cidr("10.0.0.0/24"));
    }

    #[test]
    fn owned_count_sums_ranges() {
        let mut bal = IpBalance::default();
        bal.add_own(cidr("10.0.0.0/24"));
        bal.add_own(cidr("192.168.1.0/30"));
        assert_eq!(bal.owned_count(), 256 + 4);
    }
}
