use std::fmt::{Debug, Display, Formatter};

/// An immutable set of OpenFlow wire versions, stored as a bitmap in the layout used by the
///  Hello message's version bitmap element: bit `v` is set iff version `v` is in the set.
///
/// NB: Version 0 does not exist, and versions above [ProtocolVersions::MAX_VERSION] are not
///  representable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProtocolVersions(u32);

impl ProtocolVersions {
    pub const MAX_VERSION: u8 = 30;
    const VALID_MASK: u32 = 0x7fff_fffe;

    /// All versions this driver speaks, OpenFlow 1.0 through 1.5
    pub const ALL: ProtocolVersions = ProtocolVersions(0b0111_1110);
    pub const NONE: ProtocolVersions = ProtocolVersions(0);

    pub fn from_bitmap(bitmap: u32) -> ProtocolVersions {
        ProtocolVersions(bitmap & Self::VALID_MASK)
    }

    pub fn from_version(version: u8) -> ProtocolVersions {
        if version == 0 || version > Self::MAX_VERSION {
            return Self::NONE;
        }
        ProtocolVersions(1 << version)
    }

    pub fn from_versions(versions: &[u8]) -> ProtocolVersions {
        versions.iter()
            .fold(Self::NONE, |acc, &v| acc.union(Self::from_version(v)))
    }

    pub fn bitmap(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, version: u8) -> bool {
        !Self::from_version(version).is_empty()
            && (self.0 & (1 << version)) != 0
    }

    /// The highest version in the set, 0 for an empty set
    pub fn highest_version(&self) -> u8 {
        if self.is_empty() {
            return 0;
        }
        (31 - self.0.leading_zeros()) as u8
    }

    pub fn intersection(&self, other: ProtocolVersions) -> ProtocolVersions {
        ProtocolVersions(self.0 & other.0)
    }

    pub fn union(&self, other: ProtocolVersions) -> ProtocolVersions {
        ProtocolVersions(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=Self::MAX_VERSION)
            .filter(|&v| self.contains(v))
    }

    /// Negotiates the version to use with a peer whose Hello carried `msg_version` in its header
    ///  and (optionally) a version bitmap `msg_versions`. Returns 0 if there is no common version.
    ///
    /// Peers speaking 1.3.1 or later announce their full set of versions in a bitmap, and we pick
    ///  the highest common one. Older peers only send the highest version they speak, and the
    ///  lower of the two highest versions wins - provided we speak it.
    pub fn negotiate_version(&self, msg_version: u8, msg_versions: ProtocolVersions) -> u8 {
        if msg_version >= 4 && !msg_versions.is_empty() {
            return self.intersection(msg_versions).highest_version();
        }

        let my_version = self.highest_version();
        if my_version <= msg_version {
            my_version
        }
        else if self.contains(msg_version) {
            msg_version
        }
        else {
            0
        }
    }

    /// A Hello built for this set carries the highest version in its header. The version bitmap
    ///  element is redundant if the set consists of that single version or of every version up
    ///  to it, since a peer's negotiation arrives at the same result without it.
    pub fn needs_bitmap(&self) -> bool {
        let highest = self.highest_version();
        if highest == 0 {
            return false;
        }
        let all_up_to_highest = ProtocolVersions::from_bitmap(((1u64 << (highest + 1)) - 1) as u32);
        *self != Self::from_version(highest) && *self != all_up_to_highest
    }
}

impl Display for ProtocolVersions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

impl Debug for ProtocolVersions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
