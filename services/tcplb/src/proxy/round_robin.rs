//! Round-robin backend selection.

use std::sync::{Arc, Mutex, PoisonError};

use super::backend::{Backend, ServerPool};

/// Cyclic selector over a [`ServerPool`].
///
/// The cursor is global: every caller advances the same position, so load
/// spreads evenly across alive backends no matter how many connections are
/// selecting at once.
#[derive(Debug)]
pub struct RoundRobin {
    pool: Arc<ServerPool>,
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self {
            pool,
            cursor: Mutex::new(0),
        }
    }

    /// Return the next alive backend, or `None` if a full cycle finds none.
    ///
    /// The cursor advances past every backend examined, including the one
    /// returned. At most `len(pool)` backends are examined per call.
    pub fn next(&self) -> Option<Arc<Backend>> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);

        let servers = self.pool.list_servers();
        if servers.is_empty() {
            return None;
        }

        // Membership is fixed after startup; the modulo only matters if a
        // server was added after the cursor moved.
        *cursor %= servers.len();
        let start = *cursor;

        loop {
            let candidate = &servers[*cursor];
            *cursor = (*cursor + 1) % servers.len();

            if candidate.is_alive() {
                return Some(Arc::clone(candidate));
            }

            if *cursor == start {
                return None;
            }
        }
    }
}
