use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-write sequence number of a block.
///
/// Versions order successive writes of the same block ID. [`Version::FINAL`]
/// marks the terminal write after which the block is immutable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u32);

impl Version {
    pub const INITIAL: Version = Version(0);
    pub const FINAL: Version = Version(u32::MAX);

    pub const fn new(v: u32) -> Version {
        Version(v)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_final(self) -> bool {
        self.0 == u32::MAX
    }

    /// The following version, never reaching [`Version::FINAL`].
    pub const fn next(self) -> Version {
        if self.0 >= u32::MAX - 1 {
            Version(u32::MAX - 1)
        } else {
            Version(self.0 + 1)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_final() {
            f.write_str("final")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_is_greatest() {
        assert!(Version::FINAL > Version::new(u32::MAX - 1));
        assert!(Version::FINAL.is_final());
        assert!(!Version::INITIAL.is_final());
    }

    #[test]
    fn next_saturates_below_final() {
        assert_eq!(Version::new(3).next(), Version::new(4));
        assert!(!Version::new(u32::MAX - 1).next().is_final());
        assert!(!Version::FINAL.next().is_final());
    }

    #[test]
    fn display() {
        assert_eq!(Version::new(7).to_string(), "7");
        assert_eq!(Version::FINAL.to_string(), "final");
    }
}
