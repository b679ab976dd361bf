//! Key-value storage used for archiving blocks and states.
//!
//! [`Storage`] is the capability the rest of the node depends on.
//! [`Database`] is an in-memory implementation that compresses values with Snappy.

use std::sync::Arc;

use anyhow::Result;
use im::OrdMap;
use parking_lot::Mutex;
use snap::raw::{Decoder, Encoder};

pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Returns the last key-value pair whose key is less than or equal to `key`.
    fn prev(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Returns the value with the greatest key starting with `prefix`.
    ///
    /// Keys are compared bytewise, so integers in keys must be big-endian for this to return the
    /// most recent entry.
    fn last_value(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>> {
        // No key of the form `prefix ++ suffix` sorts after `prefix ++ [u8::MAX; 64]` unless the
        // suffix is longer than 64 bytes and starts with 64 copies of `u8::MAX`.
        let mut upper_bound = prefix.to_vec();
        upper_bound.extend_from_slice(&[u8::MAX; 64]);

        let last = self
            .prev(&upper_bound)?
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, value)| value);

        Ok(last)
    }
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.as_ref().get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.as_ref().put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.as_ref().delete(key)
    }

    fn prev(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.as_ref().prev(key)
    }
}

#[derive(Default)]
pub struct Database {
    // Values are stored compressed. `Arc<[u8]>` keeps clones of the map cheap.
    map: Mutex<OrdMap<Arc<[u8]>, Arc<[u8]>>>,
}

impl Database {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        let mut map = self.map.lock();

        // Update the map atomically. A failed compression leaves it untouched.
        let mut new_map = map.clone();

        for (key, value) in pairs {
            let key = key.as_ref().into();
            let compressed = compress(value.as_ref())?.into();
            new_map.insert(key, compressed);
        }

        *map = new_map;

        Ok(())
    }

    #[must_use]
    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> bool {
        self.map.lock().contains_key(key.as_ref())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl Storage for Database {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.map
            .lock()
            .get(key)
            .map(|compressed| decompress(compressed))
            .transpose()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_batch(core::iter::once((key, value)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    /// Behaves like [`OrdMap::get_prev`].
    fn prev(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.map
            .lock()
            .get_prev(key)
            .map(|(key, value)| Ok((key.to_vec(), decompress(value)?)))
            .transpose()
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_get_and_delete() -> Result<()> {
        let database = build_database()?;

        assert_eq!(database.get(b"B")?, Some(b"2".to_vec()));
        assert_eq!(database.get(b"D")?, None);

        database.delete(b"B")?;
        database.delete(b"D")?;

        assert_eq!(database.get(b"B")?, None);
        assert!(!database.contains_key("B"));
        assert_eq!(database.len(), 3);

        Ok(())
    }

    #[test]
    fn test_multiple_of_the_same_key() -> Result<()> {
        let database = build_database()?;

        database.put(b"A", b"10")?;
        database.put_batch([("A", "100"), ("A", "1000")])?;

        assert_eq!(database.get(b"A")?, Some(b"1000".to_vec()));
        assert_eq!(database.len(), 4);

        Ok(())
    }

    // ```text
    // 0 A B C D E F
    // └─┤ │ ├─┘ ├─┘
    //   A B C   E
    // ```
    #[test_case("0" => None)]
    #[test_case("A" => Some(("A", "1")))]
    #[test_case("B" => Some(("B", "2")))]
    #[test_case("D" => Some(("C", "3")))]
    #[test_case("F" => Some(("E", "5")))]
    fn test_prev(key: &str) -> Option<(&'static str, &'static str)> {
        let database = build_database().ok()?;
        let (key, value) = database.prev(key.as_bytes()).ok()??;

        [("A", "1"), ("B", "2"), ("C", "3"), ("E", "5")]
            .into_iter()
            .find(|pair| (pair.0.as_bytes(), pair.1.as_bytes()) == (&key[..], &value[..]))
    }

    #[test]
    fn test_last_value_respects_prefix() -> Result<()> {
        let database = Database::in_memory();

        database.put(b"s\x00\x00\x00\x00\x00\x00\x00\x08", b"state 8")?;
        database.put(b"s\x00\x00\x00\x00\x00\x00\x01\x00", b"state 256")?;
        database.put(b"s\x00\x00\x00\x00\x00\x00\x00\x10", b"state 16")?;
        database.put(b"t", b"unrelated")?;

        assert_eq!(database.last_value(b"s")?, Some(b"state 256".to_vec()));
        assert_eq!(database.last_value(b"b")?, None);
        assert_eq!(database.last_value(b"u")?, None);

        Ok(())
    }

    #[test]
    fn test_values_are_stored_compressed() -> Result<()> {
        let database = Database::in_memory();
        let value = vec![7; 4096];

        database.put(b"key", &value)?;

        let stored_length = database.map.lock().get(&b"key"[..]).map(|value| value.len());

        assert!(stored_length < Some(value.len()));
        assert_eq!(database.get(b"key")?, Some(value));

        Ok(())
    }

    fn build_database() -> Result<Database> {
        let database = Database::in_memory();
        database.put_batch([("A", "1"), ("B", "2"), ("C", "3")])?;
        database.put(b"E", b"5")?;
        Ok(database)
    }
}
