//! The control-flag bitset: the sole source of truth for stream lifecycle
//! transitions (spec.md §4.2). Modeled as a small bitflags-style type in
//! h2's own idiom (`frame::settings::SettingSet` shape), but hand-rolled
//! here since the set is four bits and stable.

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Bitset over `{StreamOpen, StreamClosed, StreamCloseRequest, StreamAbort}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlFlags(u8);

impl ControlFlags {
    pub const NONE: ControlFlags = ControlFlags(0);
    pub const STREAM_OPEN: ControlFlags = ControlFlags(0b0001);
    pub const STREAM_CLOSED: ControlFlags = ControlFlags(0b0010);
    pub const STREAM_CLOSE_REQUEST: ControlFlags = ControlFlags(0b0100);
    pub const STREAM_ABORT: ControlFlags = ControlFlags(0b1000);

    pub fn contains(self, other: ControlFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: ControlFlags) {
        self.0 |= other.0;
    }

    pub fn is_open(self) -> bool {
        self.contains(Self::STREAM_OPEN)
    }

    pub fn is_closed(self) -> bool {
        self.contains(Self::STREAM_CLOSED)
    }

    pub fn is_close_request(self) -> bool {
        self.contains(Self::STREAM_CLOSE_REQUEST)
    }

    pub fn is_abort(self) -> bool {
        self.contains(Self::STREAM_ABORT)
    }
}

impl BitOr for ControlFlags {
    type Output = ControlFlags;

    fn bitor(self, rhs: ControlFlags) -> ControlFlags {
        ControlFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ControlFlags {
    fn bitor_assign(&mut self, rhs: ControlFlags) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_closed_compose() {
        let flags = ControlFlags::STREAM_OPEN | ControlFlags::STREAM_CLOSED;
        assert!(flags.is_open());
        assert!(flags.is_closed());
        assert!(!flags.is_abort());
    }

    #[test]
    fn round_trips_through_json_as_integer() {
        let flags = ControlFlags::STREAM_ABORT;
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, "8");
        let back: ControlFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(flags, back);
    }
}
