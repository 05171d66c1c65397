//! Per-direction sync cursors.
//!
//! A cursor is the watermark of the last committed sync in one direction.
//! Only one writer may hold a direction's cursor at a time: [`CursorManager::use_cursor`]
//! waits for the direction's lock and the returned [`CursorHandle`] keeps it
//! until dropped.

use crate::error::Result;
use crate::store::SharedStore;
use dashmap::DashMap;
use fieldsync_engine::{Direction, Error, Tick};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct CursorManager {
    store: SharedStore,
    locks: DashMap<Direction, Arc<Mutex<()>>>,
}

impl CursorManager {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Lock the cursor for `direction` and read it, creating it at zero when
    /// it does not exist yet.
    pub async fn use_cursor(&self, direction: Direction) -> Result<CursorHandle> {
        let lock = self.locks.entry(direction).or_default().clone();
        let guard = lock.lock_owned().await;
        let last_beat = self.store.fetch_or_create_cursor(direction).await?;
        Ok(CursorHandle {
            direction,
            last_beat,
            store: Arc::clone(&self.store),
            _guard: guard,
        })
    }

    /// Read a cursor value without keeping the lock.
    pub async fn read(&self, direction: Direction) -> Result<Tick> {
        Ok(self.use_cursor(direction).await?.last_beat())
    }
}

/// Exclusive access to one direction's cursor.
pub struct CursorHandle {
    direction: Direction,
    last_beat: Tick,
    store: SharedStore,
    _guard: OwnedMutexGuard<()>,
}

impl CursorHandle {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn last_beat(&self) -> Tick {
        self.last_beat
    }

    /// Unconditional write. Callers decide whether moving backwards is allowed.
    pub async fn advance(&mut self, value: Tick) -> Result<()> {
        self.store.update_cursor(self.direction, value).await?;
        tracing::debug!(direction = self.direction.as_str(), from = self.last_beat, to = value, "Cursor advanced");
        self.last_beat = value;
        Ok(())
    }

    /// Advance only forward. Staying put is a no-op; moving back is
    /// [`Error::CursorRegression`].
    pub async fn advance_forward(&mut self, value: Tick) -> Result<()> {
        if value < self.last_beat {
            return Err(Error::CursorRegression {
                current: self.last_beat,
                requested: value,
            }
            .into());
        }
        if value == self.last_beat {
            return Ok(());
        }
        self.advance(value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::{MemoryStore, SyncStore};
    use std::time::Duration;

    fn manager() -> (Arc<MemoryStore>, CursorManager) {
        let store = Arc::new(MemoryStore::new());
        let shared: SharedStore = store.clone();
        (store, CursorManager::new(shared))
    }

    #[tokio::test]
    async fn missing_cursor_starts_at_zero() {
        let (_, cursors) = manager();
        assert_eq!(cursors.read(Direction::Outgoing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn advance_forward_refuses_to_move_back() {
        let (store, cursors) = manager();
        let mut handle = cursors.use_cursor(Direction::Incoming).await.unwrap();
        handle.advance_forward(12).await.unwrap();
        handle.advance_forward(12).await.unwrap();

        let err = handle.advance_forward(5).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Engine(Error::CursorRegression { current: 12, requested: 5 })
        ));
        assert_eq!(store.fetch_or_create_cursor(Direction::Incoming).await.unwrap(), 12);

        // the plain write is unconditional
        handle.advance(3).await.unwrap();
        assert_eq!(handle.last_beat(), 3);
    }

    #[tokio::test]
    async fn one_writer_per_direction() {
        let (_, cursors) = manager();
        let cursors = Arc::new(cursors);
        let held = cursors.use_cursor(Direction::Outgoing).await.unwrap();

        // the other direction is independent
        let other = cursors.use_cursor(Direction::Incoming).await.unwrap();
        assert_eq!(other.direction(), Direction::Incoming);

        let waiting = {
            let cursors = Arc::clone(&cursors);
            tokio::spawn(async move { cursors.use_cursor(Direction::Outgoing).await.map(|h| h.last_beat()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(held);
        assert_eq!(waiting.await.unwrap().unwrap(), 0);
    }
}
