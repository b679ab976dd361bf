use core::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::GindexError;

/// A generalized index: the position of a node in a binary tree with the root at 1.
///
/// The children of node `g` are `2g` and `2g + 1`.
/// The bits of a generalized index after the leading 1 spell out the path from the root,
/// with 0 meaning "go left" and 1 meaning "go right".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Deserialize, Serialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Gindex(u64);

impl Gindex {
    pub const ROOT: Self = Self(1);

    pub const fn new(value: u64) -> Result<Self, GindexError> {
        if value == 0 {
            return Err(GindexError::Zero);
        }

        Ok(Self(value))
    }

    /// # Panics
    ///
    /// Panics if `index` does not fit in `depth` bits or `depth` is 64 or more.
    #[must_use]
    pub const fn from_depth_and_index(depth: u8, index: u64) -> Self {
        assert!(depth < 64);
        assert!(index >> depth == 0);
        Self((1 << depth) | index)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Number of edges between the root and the node.
    #[must_use]
    pub const fn depth(self) -> u8 {
        // The leading 1 is guaranteed to be present, so this cannot underflow.
        (u64::BITS - 1 - self.0.leading_zeros()) as u8
    }

    /// Position of the node among all nodes at the same depth, counting from the left.
    #[must_use]
    pub const fn index_at_depth(self) -> u64 {
        self.0 ^ (1 << self.depth())
    }

    #[must_use]
    pub const fn left_child(self) -> Self {
        Self(self.0 << 1)
    }

    #[must_use]
    pub const fn right_child(self) -> Self {
        Self((self.0 << 1) | 1)
    }

    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        if self.0 == 1 {
            None
        } else {
            Some(Self(self.0 >> 1))
        }
    }

    /// Whether the path from the root turns left after `level` steps.
    ///
    /// `level` 0 is the first step below the root.
    #[must_use]
    pub const fn goes_left_at(self, level: u8) -> bool {
        let shift = self.depth() - level - 1;
        (self.0 >> shift) & 1 == 0
    }

    /// Iterates over the turns of the path from the root. `true` means left.
    pub fn path(self) -> impl Iterator<Item = bool> {
        (0..self.depth()).map(move |level| self.goes_left_at(level))
    }
}

impl TryFrom<u64> for Gindex {
    type Error = GindexError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Gindex> for u64 {
    fn from(gindex: Gindex) -> Self {
        gindex.0
    }
}

impl Display for Gindex {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        write!(formatter, "{:b}", self.0)
    }
}

/// Parses a bit string like `"1011"`.
impl FromStr for Gindex {
    type Err = GindexError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let mut chars = string.chars();

        match chars.next() {
            Some('1') => {}
            Some(found) => return Err(GindexError::MissingLeadingOne { found }),
            None => return Err(GindexError::Empty),
        }

        let depth = string.len() - 1;

        if depth >= 64 {
            return Err(GindexError::TooDeep { depth });
        }

        chars.try_fold(Self::ROOT, |gindex, character| match character {
            '0' => Ok(gindex.left_child()),
            '1' => Ok(gindex.right_child()),
            found => Err(GindexError::InvalidCharacter { found }),
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(1, 0, 0)]
    #[test_case(2, 1, 0)]
    #[test_case(3, 1, 1)]
    #[test_case(13, 3, 5)]
    #[test_case(1 << 40, 40, 0)]
    fn depth_and_index_are_split_correctly(value: u64, depth: u8, index: u64) {
        let gindex = Gindex::new(value).expect("value is nonzero");

        assert_eq!(gindex.depth(), depth);
        assert_eq!(gindex.index_at_depth(), index);
        assert_eq!(Gindex::from_depth_and_index(depth, index), gindex);
    }

    #[test]
    fn bit_strings_are_parsed_into_paths() -> Result<(), GindexError> {
        let gindex = "1011".parse::<Gindex>()?;

        assert_eq!(gindex.get(), 11);
        assert_eq!(gindex.path().collect::<Vec<_>>(), [true, false, false]);
        assert_eq!(gindex.to_string(), "1011");

        Ok(())
    }

    #[test_case("" => GindexError::Empty)]
    #[test_case("0" => GindexError::MissingLeadingOne { found: '0' })]
    #[test_case("10a" => GindexError::InvalidCharacter { found: 'a' })]
    fn malformed_bit_strings_are_rejected(string: &str) -> GindexError {
        string
            .parse::<Gindex>()
            .expect_err("string should not be a valid generalized index")
    }

    #[test]
    fn zero_is_not_a_generalized_index() {
        assert_eq!(Gindex::new(0), Err(GindexError::Zero));
    }
}
