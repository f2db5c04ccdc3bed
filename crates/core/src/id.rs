//! Session-unique identifiers for obstacles and joints.
//!
//! An ID packs the short UID of the allocating peer into the upper 32 bits
//! and a per-peer monotonic counter into the lower 32. IDs are never reused
//! within a session.

use std::fmt;

/// Upper half reserved for obstacles created before the handshake assigns
/// a short UID (scene bootstrap).
pub const INIT_UID: u32 = 0xFFFF_FFFF;

/// Globally unique obstacle identifier: `(short_uid << 32) | counter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObstacleId(u64);

impl ObstacleId {
    pub const fn new(short_uid: u32, counter: u32) -> Self {
        Self(((short_uid as u64) << 32) | counter as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Short UID of the peer that allocated this ID.
    pub const fn short_uid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Per-peer allocation counter.
    pub const fn counter(self) -> u32 {
        self.0 as u32
    }

    /// True for pre-handshake bootstrap obstacles.
    pub const fn is_init(self) -> bool {
        self.short_uid() == INIT_UID
    }
}

impl fmt::Display for ObstacleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Globally unique joint identifier, same layout as [`ObstacleId`] but drawn
/// from an independent counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JointId(u64);

impl JointId {
    pub const fn new(short_uid: u32, counter: u32) -> Self {
        Self(((short_uid as u64) << 32) | counter as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn short_uid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn counter(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packing() {
        let id = ObstacleId::new(7, 0);
        assert_eq!(id.raw(), 0x0000_0007_0000_0000);
        assert_eq!(id.short_uid(), 7);
        assert_eq!(id.counter(), 0);

        let id = ObstacleId::new(7, 1);
        assert_eq!(id.raw(), 0x0000_0007_0000_0001);
    }

    #[test]
    fn init_sentinel() {
        let id = ObstacleId::new(INIT_UID, 2);
        assert_eq!(id.raw(), 0xFFFF_FFFF_0000_0002);
        assert!(id.is_init());
        assert!(!ObstacleId::new(1, 2).is_init());
    }

    #[test]
    fn roundtrip_raw() {
        let id = ObstacleId::new(42, 99);
        assert_eq!(ObstacleId::from_raw(id.raw()), id);
    }
}
