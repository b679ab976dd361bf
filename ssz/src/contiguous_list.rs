use core::ops::{Deref, DerefMut};

use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use crate::{error::ListTooLong, porcelain::SszHash};

/// A list of at most `N` elements stored in a single allocation.
///
/// Derefs to a slice, so elements can be modified in place but the length can only change
/// through methods that enforce the limit.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
pub struct ContiguousList<T: Clone, const N: usize> {
    elements: Vec<T>,
}

impl<T: Clone, const N: usize> Default for ContiguousList<T, N> {
    fn default() -> Self {
        Self { elements: vec![] }
    }
}

impl<T: Clone, const N: usize> Deref for ContiguousList<T, N> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.elements
    }
}

impl<T: Clone, const N: usize> DerefMut for ContiguousList<T, N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.elements
    }
}

impl<T: Clone, const N: usize> TryFrom<Vec<T>> for ContiguousList<T, N> {
    type Error = ListTooLong;

    fn try_from(elements: Vec<T>) -> Result<Self, Self::Error> {
        if elements.len() > N {
            return Err(ListTooLong {
                maximum: N,
                actual: elements.len(),
            });
        }

        Ok(Self { elements })
    }
}

impl<T: Clone, const N: usize> From<ContiguousList<T, N>> for Vec<T> {
    fn from(list: ContiguousList<T, N>) -> Self {
        list.elements
    }
}

impl<T: Clone, const N: usize> IntoIterator for ContiguousList<T, N> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.into_iter()
    }
}

impl<'list, T: Clone, const N: usize> IntoIterator for &'list ContiguousList<T, N> {
    type Item = &'list T;
    type IntoIter = core::slice::Iter<'list, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

impl<T: Clone + SszHash, const N: usize> SszHash for ContiguousList<T, N> {
    fn hash_tree_root(&self) -> H256 {
        T::list_root(&self.elements, N)
    }
}

impl<T: Clone, const N: usize> ContiguousList<T, N> {
    pub fn try_from_iter(elements: impl IntoIterator<Item = T>) -> Result<Self, ListTooLong> {
        Self::try_from(elements.into_iter().collect::<Vec<_>>())
    }

    pub fn push(&mut self, element: T) -> Result<(), ListTooLong> {
        if self.elements.len() >= N {
            return Err(ListTooLong {
                maximum: N,
                actual: self.elements.len() + 1,
            });
        }

        self.elements.push(element);

        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.elements.pop()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_stops_at_limit() -> Result<(), ListTooLong> {
        let mut list = ContiguousList::<u64, 2>::default();

        list.push(1)?;
        list.push(2)?;

        assert_eq!(
            list.push(3),
            Err(ListTooLong {
                maximum: 2,
                actual: 3,
            }),
        );
        assert_eq!(*list, [1, 2]);

        Ok(())
    }

    #[test]
    fn root_depends_on_limit() -> Result<(), ListTooLong> {
        let small = ContiguousList::<u64, 4>::try_from(vec![1, 2])?;
        let large = ContiguousList::<u64, 1024>::try_from(vec![1, 2])?;

        assert_ne!(small.hash_tree_root(), large.hash_tree_root());

        Ok(())
    }
}
