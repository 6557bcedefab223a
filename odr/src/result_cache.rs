use std::sync::Arc;

use anyhow::Result;
use database::Database;
use itertools::Itertools as _;
use log::debug;
use parking_lot::Mutex;

const ORDER_KEY_PREFIX: &str = "odr_order/";

// Cached results occupy the insertion numbers `oldest..next`.
#[derive(Clone, Copy, Default)]
struct Window {
    oldest: u64,
    next: u64,
}

impl Window {
    const fn len(self) -> u64 {
        self.next - self.oldest
    }
}

/// Verified results kept in insertion order and evicted oldest first.
///
/// Each result is stored under its own key together with an order entry pointing back to it.
pub struct ResultCache {
    database: Arc<Database>,
    max_entries: u64,
    window: Mutex<Window>,
}

impl ResultCache {
    pub fn new(database: Arc<Database>, max_entries: u64) -> Result<Self> {
        let oldest = database
            .next(order_key(0))?
            .and_then(|(key, _)| parse_order_key(&key));

        let newest = database
            .prev(order_key(u64::MAX))?
            .and_then(|(key, _)| parse_order_key(&key));

        let mut window = match (oldest, newest) {
            (Some(oldest), Some(newest)) => Window {
                oldest,
                next: newest + 1,
            },
            _ => Window::default(),
        };

        let cache = Self {
            database,
            max_entries,
            window: Mutex::default(),
        };

        cache.evict(&mut window)?;

        *cache.window.lock() = window;

        Ok(cache)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.database.get(key)
    }

    /// Stores `payload` under `key` unless it is already cached.
    pub fn insert(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        let mut window = self.window.lock();

        if self.database.contains_key(key)? {
            return Ok(());
        }

        self.database.put_batch([
            (order_key(window.next).into_bytes(), key.to_vec()),
            (key.to_vec(), payload.to_vec()),
        ])?;

        window.next += 1;

        self.evict(&mut window)
    }

    fn evict(&self, window: &mut Window) -> Result<()> {
        if window.len() <= self.max_entries {
            return Ok(());
        }

        let new_oldest = window.next - self.max_entries;
        let start = order_key(window.oldest);
        let end = order_key(new_oldest);

        let result_keys = itertools::process_results(
            self.database.iterator_ascending(start.as_str()..)?,
            |pairs| {
                pairs
                    .take_while(|(key, _)| **key < *end.as_bytes())
                    .map(|(_, result_key)| result_key)
                    .collect_vec()
            },
        )?;

        for result_key in &result_keys {
            self.database.delete(result_key)?;
        }

        self.database.delete_range(start.as_str()..end.as_str())?;

        debug!("evicted {} cached ODR results", result_keys.len());

        window.oldest = new_oldest;

        Ok(())
    }
}

fn order_key(number: u64) -> String {
    format!("{ORDER_KEY_PREFIX}{number:020}")
}

fn parse_order_key(key: &[u8]) -> Option<u64> {
    let digits = key.strip_prefix(ORDER_KEY_PREFIX.as_bytes())?;
    core::str::from_utf8(digits).ok()?.parse().ok()
}
