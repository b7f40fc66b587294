use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TopologyError;

/// SCSI bus address of a logical unit: host, channel, target, lun.
///
/// Ordering is lexicographic on the tuple, which is what the derived `Ord`
/// gives us given the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hctl {
    pub host: u32,
    pub channel: u32,
    pub target: u32,
    pub lun: u64,
}

impl Hctl {
    pub const fn new(host: u32, channel: u32, target: u32, lun: u64) -> Self {
        Self {
            host,
            channel,
            target,
            lun,
        }
    }

    pub fn target_address(&self) -> TargetAddress {
        TargetAddress {
            host: self.host,
            channel: self.channel,
            target: self.target,
        }
    }
}

impl fmt::Display for Hctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.host, self.channel, self.target, self.lun
        )
    }
}

impl FromStr for Hctl {
    type Err = TopologyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || TopologyError::InvalidHctl(value.to_string());
        let mut parts = value.trim().split(':');
        let host = parse_part(parts.next()).ok_or_else(invalid)?;
        let channel = parse_part(parts.next()).ok_or_else(invalid)?;
        let target = parse_part(parts.next()).ok_or_else(invalid)?;
        let lun = parse_part(parts.next()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(host, channel, target, lun))
    }
}

fn parse_part<T: FromStr>(part: Option<&str>) -> Option<T> {
    let part = part?;
    if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl Serialize for Hctl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hctl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The host/channel/target prefix of an [`Hctl`], i.e. one SCSI target as
/// seen from one initiator port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetAddress {
    pub host: u32,
    pub channel: u32,
    pub target: u32,
}

impl TargetAddress {
    pub const fn new(host: u32, channel: u32, target: u32) -> Self {
        Self {
            host,
            channel,
            target,
        }
    }

    pub fn lun(&self, lun: u64) -> Hctl {
        Hctl::new(self.host, self.channel, self.target, lun)
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.channel, self.target)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{Hctl, TargetAddress};

    #[test]
    fn parses_and_prints_canonical_form() {
        let hctl: Hctl = "3:0:12:254".parse().expect("valid hctl");
        assert_eq!(hctl, Hctl::new(3, 0, 12, 254));
        assert_eq!(hctl.to_string(), "3:0:12:254");

        for sample in [
            Hctl::new(0, 0, 0, 0),
            Hctl::new(7, 1, 65_535, 16_389),
            Hctl::new(u32::MAX, u32::MAX, u32::MAX, u64::MAX),
        ] {
            assert_eq!(sample.to_string().parse::<Hctl>().expect("round trip"), sample);
        }
    }

    #[test]
    fn rejects_malformed_addresses() {
        for raw in ["", "1:2:3", "1:2:3:4:5", "a:0:0:0", "1::0:0", "-1:0:0:0", "1:0:0:+2"] {
            assert!(raw.parse::<Hctl>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn orders_lexicographically() {
        assert!(Hctl::new(1, 0, 0, 1) < Hctl::new(1, 0, 0, 2));
        assert!(Hctl::new(1, 0, 5, 9) < Hctl::new(1, 1, 0, 0));
        assert!(Hctl::new(0, 9, 9, 9) < Hctl::new(1, 0, 0, 0));

        let mut addresses = vec![
            Hctl::new(2, 0, 0, 0),
            Hctl::new(1, 0, 1, 0),
            Hctl::new(1, 0, 0, 3),
        ];
        addresses.sort();
        assert_eq!(
            addresses,
            vec![
                Hctl::new(1, 0, 0, 3),
                Hctl::new(1, 0, 1, 0),
                Hctl::new(2, 0, 0, 0)
            ]
        );
    }

    #[test]
    fn equal_addresses_hash_together() {
        let set: HashSet<Hctl> = [Hctl::new(1, 0, 0, 1), "1:0:0:1".parse().expect("valid")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&Hctl::new(0, 1, 2, 3)).expect("serialize");
        assert_eq!(json, "\"0:1:2:3\"");
        let back: Hctl = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Hctl::new(0, 1, 2, 3));
    }

    #[test]
    fn target_address_extends_to_lun() {
        let target = TargetAddress::new(4, 0, 2);
        assert_eq!(target.lun(7), Hctl::new(4, 0, 2, 7));
        assert_eq!(target.lun(7).target_address(), target);
        assert_eq!(target.to_string(), "4:0:2");
    }
}
