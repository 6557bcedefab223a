use core::ops::{Range, RangeFrom};
use std::{
    borrow::Cow,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use bytesize::ByteSize;
use im::OrdMap;
use itertools::Either;
use libmdbx::{DatabaseFlags, Environment, Geometry, WriteFlags};
use log::info;
use snap::raw::{Decoder, Encoder};
use tap::Pipe as _;
use thiserror::Error;
use unwrap_none::UnwrapNone as _;

const GROWTH_STEP: ByteSize = ByteSize::mib(16);
const MAX_NAMED_DATABASES: usize = 4;

#[derive(Clone, Copy)]
pub enum DatabaseMode {
    ReadOnly,
    ReadWrite,
}

impl DatabaseMode {
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    #[must_use]
    pub const fn mode_permissions(self) -> u16 {
        match self {
            // Zero means to open an existing environment without creating files.
            Self::ReadOnly => 0,
            Self::ReadWrite => 0o600,
        }
    }

    #[must_use]
    #[cfg(target_os = "linux")]
    pub fn permissions(self) -> u32 {
        self.mode_permissions().into()
    }

    #[must_use]
    #[cfg(not(target_os = "linux"))]
    pub const fn permissions(self) -> u16 {
        self.mode_permissions()
    }
}

/// Ordered key-value store with Snappy-compressed values.
///
/// Several named databases can share one directory. The light client keeps server pool records
/// and cached retrieval results in the same database under distinct key prefixes.
pub struct Database(DatabaseKind);

impl Database {
    pub fn persistent(
        name: &str,
        directory: impl AsRef<Path>,
        max_size: ByteSize,
        mode: DatabaseMode,
    ) -> Result<Self> {
        let directory = directory.as_ref();

        if directory.to_str().is_none() {
            return Err(Error::NonUnicodePath.into());
        }

        if !mode.is_read_only() {
            fs_err::create_dir_all(directory)?;
        }

        let environment = Environment::builder()
            .set_max_dbs(MAX_NAMED_DATABASES)
            .set_geometry(Geometry {
                size: Some(..usize::try_from(max_size.as_u64())?),
                growth_step: Some(isize::try_from(GROWTH_STEP.as_u64())?),
                shrink_threshold: None,
                page_size: None,
            })
            .open_with_permissions(directory, mode.permissions())?;

        if !mode.is_read_only() {
            let transaction = environment.begin_rw_txn()?;
            transaction.create_db(Some(name), DatabaseFlags::default())?;
            transaction.commit()?;
        }

        info!("database: {name} in {}", directory.display());

        Ok(Self(DatabaseKind::Persistent {
            database_name: name.to_owned(),
            environment,
        }))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(DatabaseKind::InMemory {
            map: Mutex::default(),
        })
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                if cursor.set::<()>(key.as_ref())?.is_some() {
                    cursor.del(WriteFlags::default())?;
                    transaction.commit()?;
                }
            }
            DatabaseKind::InMemory { map } => {
                map.lock()
                    .expect("in-memory database mutex is poisoned")
                    .remove(key.as_ref());
            }
        }

        Ok(())
    }

    /// Deletes keys in `range`, excluding `range.end`.
    pub fn delete_range(&self, range: Range<impl AsRef<[u8]>>) -> Result<()> {
        let start = range.start.as_ref();
        let end = range.end.as_ref();

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                let Some((mut key, ())) = cursor.set_range::<Cow<_>, _>(start)? else {
                    return Ok(());
                };

                while *key < *end {
                    cursor.del(WriteFlags::default())?;

                    match cursor.next::<Cow<_>, _>()? {
                        Some((new_key, ())) => key = new_key,
                        None => break,
                    }
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                let end_pair = map.get_key_value(end);
                let (below, _) = new_map.split(start);
                let (_, above) = new_map.split(end);

                new_map = below.union(above);

                if let Some((key, value)) = end_pair {
                    new_map
                        .insert(Arc::clone(key), Arc::clone(value))
                        .expect_none("end_pair should have been discarded by OrdMap::split");
                }

                *map = new_map;
            }
        }

        Ok(())
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let contains_key = match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                transaction
                    .get::<()>(database.dbi(), key.as_ref())?
                    .is_some()
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .contains_key(key.as_ref()),
        };

        Ok(contains_key)
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                transaction
                    .get::<Cow<_>>(database.dbi(), key.as_ref())?
                    .map(|compressed| decompress(&compressed))
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .get(key.as_ref())
                .map(|compressed| decompress(compressed)),
        }
        .transpose()
    }

    #[expect(clippy::type_complexity)]
    pub fn iterator_ascending(
        &self,
        range: RangeFrom<impl AsRef<[u8]>>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let start = range.start.as_ref();

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor
                    .set_range(start)
                    .transpose()
                    .into_iter()
                    .chain(core::iter::from_fn(move || cursor.next().transpose()))
                    .map(|result| decompress_pair(result?))
                    .pipe(Either::Left)
            }
            DatabaseKind::InMemory { map } => {
                let map = map.lock().expect("in-memory database mutex is poisoned");
                let start_pair = map.get_key_value(start);
                let (_, mut above) = map.split(start);

                if let Some((key, value)) = start_pair {
                    above
                        .insert(Arc::clone(key), Arc::clone(value))
                        .expect_none("start_pair should have been discarded by OrdMap::split");
                }

                above
                    .into_iter()
                    .map(|(key, value)| Ok((Cow::Owned(key.to_vec()), decompress(value.as_ref())?)))
                    .pipe(Either::Right)
            }
        }
        .pipe(Ok)
    }

    /// Returns pairs whose keys start with `prefix` in ascending order.
    #[expect(clippy::type_complexity)]
    pub fn iterator_prefix(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let prefix = prefix.as_ref().to_vec();

        self.iterator_ascending(prefix.clone()..)?
            .take_while(move |result| match result {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            })
            .pipe(Ok)
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_batch(core::iter::once((key, value)))
    }

    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                for (key, value) in pairs {
                    let key = key.as_ref();
                    let compressed = compress(value.as_ref())?;
                    transaction.put(database.dbi(), key, compressed, WriteFlags::default())?;
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                for (key, value) in pairs {
                    let key = key.as_ref().into();
                    let compressed = compress(value.as_ref())?.into();
                    new_map.insert(key, compressed);
                }

                *map = new_map;
            }
        }

        Ok(())
    }

    /// Returns the last key-value pair whose key is less than or equal to `key`.
    pub fn prev(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor
                    .set_key(key.as_ref())
                    .transpose()
                    .or_else(|| cursor.prev().transpose())
                    .transpose()?
                    .map(decompress_pair)
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .get_prev(key.as_ref())
                .map(|(key, value)| Ok((key.to_vec(), decompress(value)?))),
        }
        .transpose()
    }

    /// Returns the first key-value pair whose key is greater than or equal to `key`.
    pub fn next(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor.set_range(key.as_ref())?.map(decompress_pair)
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .get_next(key.as_ref())
                .map(|(key, value)| Ok((key.to_vec(), decompress(value)?))),
        }
        .transpose()
    }

    const fn kind(&self) -> &DatabaseKind {
        &self.0
    }
}

enum DatabaseKind {
    Persistent {
        database_name: String,
        environment: Environment,
    },
    InMemory {
        // `OrdMap` clones its elements on every split and insert.
        map: Mutex<InMemoryMap>,
    },
}

#[derive(Debug, Error)]
enum Error {
    #[error("database directory path should be a valid Unicode string")]
    NonUnicodePath,
}

type InMemoryMap = OrdMap<Arc<[u8]>, Arc<[u8]>>;

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}

fn decompress_pair<K>((key, compressed_value): (K, Cow<[u8]>)) -> Result<(K, Vec<u8>)> {
    let value = decompress(&compressed_value)?;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    type Constructor = fn(&TempDir) -> Result<Database>;

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_delete(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        database.delete("A")?;
        database.delete("D")?;

        assert_pairs_eq(
            database.iterator_ascending("0"..)?,
            [("B", "2"), ("C", "3"), ("E", "5")],
        )?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_delete_range_excludes_end(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        database.delete_range("B".."E")?;

        assert_pairs_eq(database.iterator_ascending("A"..)?, [("A", "1"), ("E", "5")])?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_contains_key(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        assert!(database.contains_key("A")?);
        assert!(database.contains_key("C")?);
        assert!(!database.contains_key("D")?);
        assert!(database.contains_key("E")?);

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_iterator_ascending(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        assert_pairs_eq(
            database.iterator_ascending("0"..)?,
            [("A", "1"), ("B", "2"), ("C", "3"), ("E", "5")],
        )?;

        assert_pairs_eq(
            database.iterator_ascending("C"..)?,
            [("C", "3"), ("E", "5")],
        )?;

        assert_pairs_eq(database.iterator_ascending("D"..)?, [("E", "5")])?;
        assert_pairs_eq(database.iterator_ascending("F"..)?, [])?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_iterator_prefix(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        database.put_batch([("peer/1", "x"), ("peer/2", "y"), ("result/1", "z")])?;

        assert_pairs_eq(
            database.iterator_prefix("peer/")?,
            [("peer/1", "x"), ("peer/2", "y")],
        )?;

        assert_pairs_eq(database.iterator_prefix("missing/")?, [])?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_multiple_of_the_same_key(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        database.put_batch([("A", "1"), ("A", "2"), ("A", "3")])?;

        assert_eq!(database.get("A")?, Some(to_bytes("3")));

        Ok(())
    }

    // ```text
    // 0 A B C D E F
    //   │ │ ├─┘ ├─┘
    //   A B C   E
    // ```
    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_prev(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        assert_eq!(database.prev("0")?, None);
        assert_eq!(database.prev("A")?, Some(to_bytes_pair(("A", "1"))));
        assert_eq!(database.prev("D")?, Some(to_bytes_pair(("C", "3"))));
        assert_eq!(database.prev("F")?, Some(to_bytes_pair(("E", "5"))));

        Ok(())
    }

    // ```text
    // 0 A B C D E F
    // └─┤ │ │ └─┤
    //   A B C   E
    // ```
    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_next(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;

        assert_eq!(database.next("0")?, Some(to_bytes_pair(("A", "1"))));
        assert_eq!(database.next("C")?, Some(to_bytes_pair(("C", "3"))));
        assert_eq!(database.next("D")?, Some(to_bytes_pair(("E", "5"))));
        assert_eq!(database.next("F")?, None);

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_isolation(constructor: Constructor) -> Result<()> {
        let directory = TempDir::new()?;
        let database = constructor(&directory)?;
        let iterator = database.iterator_ascending("A"..)?;

        database.delete_range("A".."F")?;

        assert_pairs_eq(iterator, [("A", "1"), ("B", "2"), ("C", "3"), ("E", "5")])?;

        Ok(())
    }

    #[test]
    fn test_persistent_database_survives_reopening() -> Result<()> {
        let directory = TempDir::new()?;

        drop(build_persistent_database(&directory)?);

        let reopened = Database::persistent(
            "test_db",
            directory.path(),
            ByteSize::mib(1),
            DatabaseMode::ReadWrite,
        )?;

        assert_eq!(reopened.get("B")?, Some(to_bytes("2")));
        assert_eq!(reopened.iterator_ascending("0"..)?.count(), 4);

        Ok(())
    }

    fn build_persistent_database(directory: &TempDir) -> Result<Database> {
        let database = Database::persistent(
            "test_db",
            directory.path(),
            ByteSize::mib(1),
            DatabaseMode::ReadWrite,
        )?;

        populate_database(&database)?;
        Ok(database)
    }

    fn build_in_memory_database(_directory: &TempDir) -> Result<Database> {
        let database = Database::in_memory();
        populate_database(&database)?;
        Ok(database)
    }

    fn populate_database(database: &Database) -> Result<()> {
        // This indirectly tests `Database::put` and `Database::put_batch`.
        database.put_batch([("A", "1"), ("B", "2"), ("C", "3")])?;
        database.put("E", "5")?;
        Ok(())
    }

    fn assert_pairs_eq<'strings>(
        actual_pairs: impl IntoIterator<Item = Result<(impl AsRef<[u8]>, impl AsRef<[u8]>)>>,
        expected_pairs: impl IntoIterator<Item = (&'strings str, &'strings str)>,
    ) -> Result<()> {
        let actual_pairs = to_string_pairs(actual_pairs)?;
        let expected_pairs = to_string_pairs(expected_pairs.into_iter().map(Ok))?;

        assert_eq!(actual_pairs, expected_pairs);

        Ok(())
    }

    fn to_string_pairs(
        pairs: impl IntoIterator<Item = Result<(impl AsRef<[u8]>, impl AsRef<[u8]>)>>,
    ) -> Result<Vec<(String, String)>> {
        pairs
            .into_iter()
            .map(|result| {
                let (key, value) = result?;
                let key_string = core::str::from_utf8(key.as_ref())?;
                let value_string = core::str::from_utf8(value.as_ref())?;
                Ok((key_string.to_owned(), value_string.to_owned()))
            })
            .collect()
    }

    fn to_bytes_pair((key, value): (&str, &str)) -> (Vec<u8>, Vec<u8>) {
        (to_bytes(key), to_bytes(value))
    }

    fn to_bytes(string: &str) -> Vec<u8> {
        string.as_bytes().to_vec()
    }
}
