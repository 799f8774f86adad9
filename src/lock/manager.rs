// ============================================================================
// Lock Manager
// ============================================================================

use crate::core::EntityTuple;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Client {origin_id} (instance {instance_id}) holds no read lock on '{tuple}'")]
    ReadLockNotHeld {
        tuple: EntityTuple,
        origin_id: u64,
        instance_id: u64,
    },

    #[error("Client {origin_id} holds no write lock on '{tuple}'")]
    WriteLockNotHeld { tuple: EntityTuple, origin_id: u64 },
}

enum Waiter<C> {
    Read {
        origin_id: u64,
        instance_id: u64,
        on_acquire: C,
    },
    Write {
        origin_id: u64,
        on_acquire: C,
    },
}

struct EntityLock<C> {
    // (origin, instance) -> how many times that pair holds the read lock
    readers: HashMap<(u64, u64), usize>,
    writer: Option<u64>,
    waiters: VecDeque<Waiter<C>>,
}

impl<C> EntityLock<C> {
    fn new() -> Self {
        Self {
            readers: HashMap::new(),
            writer: None,
            waiters: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.waiters.is_empty()
    }

    fn can_grant_read(&self) -> bool {
        self.writer.is_none()
    }

    fn can_grant_write(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn add_reader(&mut self, origin_id: u64, instance_id: u64) {
        *self.readers.entry((origin_id, instance_id)).or_insert(0) += 1;
    }

    /// Grants queued requests from the head of the queue for as long as they
    /// are compatible with the current holders.
    fn grant_waiters(&mut self) -> Vec<C> {
        let mut granted = Vec::new();
        loop {
            let grantable = match self.waiters.front() {
                Some(Waiter::Read { .. }) => self.can_grant_read(),
                Some(Waiter::Write { .. }) => self.can_grant_write(),
                None => false,
            };
            if !grantable {
                break;
            }
            match self.waiters.pop_front() {
                Some(Waiter::Read {
                    origin_id,
                    instance_id,
                    on_acquire,
                }) => {
                    self.add_reader(origin_id, instance_id);
                    granted.push(on_acquire);
                }
                Some(Waiter::Write {
                    origin_id,
                    on_acquire,
                }) => {
                    self.writer = Some(origin_id);
                    granted.push(on_acquire);
                }
                None => break,
            }
        }
        granted
    }
}

/// Read/write lock table keyed by [`EntityTuple`].
///
/// `C` is the continuation stored with a waiting request. Every acquire
/// returns `Some(on_acquire)` when the lock is granted on the spot and `None`
/// when the request was queued; releases return the continuations of the
/// requests they granted, in grant order. The caller is expected to run
/// those continuations itself.
pub struct LockManager<C> {
    locks: HashMap<EntityTuple, EntityLock<C>>,
}

impl<C> Default for LockManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> LockManager<C> {
    pub fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn lock_for(&mut self, tuple: &EntityTuple) -> &mut EntityLock<C> {
        self.locks
            .entry(tuple.clone())
            .or_insert_with(EntityLock::new)
    }

    fn forget_if_idle(&mut self, tuple: &EntityTuple) {
        if self.locks.get(tuple).is_some_and(EntityLock::is_idle) {
            self.locks.remove(tuple);
        }
    }

    pub fn acquire_read_lock(
        &mut self,
        tuple: &EntityTuple,
        origin_id: u64,
        instance_id: u64,
        on_acquire: C,
    ) -> Option<C> {
        let lock = self.lock_for(tuple);
        // Queued writers keep their place: new readers never overtake them.
        if lock.waiters.is_empty() && lock.can_grant_read() {
            lock.add_reader(origin_id, instance_id);
            Some(on_acquire)
        } else {
            lock.waiters.push_back(Waiter::Read {
                origin_id,
                instance_id,
                on_acquire,
            });
            None
        }
    }

    pub fn release_read_lock(
        &mut self,
        tuple: &EntityTuple,
        origin_id: u64,
        instance_id: u64,
    ) -> Result<Vec<C>, LockError> {
        let not_held = || LockError::ReadLockNotHeld {
            tuple: tuple.clone(),
            origin_id,
            instance_id,
        };
        let lock = self.locks.get_mut(tuple).ok_or_else(not_held)?;
        let key = (origin_id, instance_id);
        match lock.readers.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                lock.readers.remove(&key);
            }
            None => return Err(not_held()),
        }
        let granted = lock.grant_waiters();
        self.forget_if_idle(tuple);
        Ok(granted)
    }

    pub fn acquire_write_lock(
        &mut self,
        tuple: &EntityTuple,
        origin_id: u64,
        on_acquire: C,
    ) -> Option<C> {
        let lock = self.lock_for(tuple);
        if lock.waiters.is_empty() && lock.can_grant_write() {
            lock.writer = Some(origin_id);
            Some(on_acquire)
        } else {
            lock.waiters.push_back(Waiter::Write {
                origin_id,
                on_acquire,
            });
            None
        }
    }

    /// Takes the write lock only if it is free right now. Never queues.
    pub fn try_acquire_write_lock(&mut self, tuple: &EntityTuple, origin_id: u64) -> bool {
        let lock = self.lock_for(tuple);
        let granted = lock.waiters.is_empty() && lock.can_grant_write();
        if granted {
            lock.writer = Some(origin_id);
        }
        self.forget_if_idle(tuple);
        granted
    }

    pub fn release_write_lock(
        &mut self,
        tuple: &EntityTuple,
        origin_id: u64,
    ) -> Result<Vec<C>, LockError> {
        let lock = match self.locks.get_mut(tuple) {
            Some(lock) if lock.writer == Some(origin_id) => lock,
            _ => {
                return Err(LockError::WriteLockNotHeld {
                    tuple: tuple.clone(),
                    origin_id,
                });
            }
        };
        lock.writer = None;
        let granted = lock.grant_waiters();
        self.forget_if_idle(tuple);
        Ok(granted)
    }

    /// Reinstates a write lock a reconnecting client held before a fail-over.
    ///
    /// The request skips every queued waiter; it only waits for holders that
    /// are already in place.
    pub fn restore_write_lock(
        &mut self,
        tuple: &EntityTuple,
        origin_id: u64,
        on_acquire: C,
    ) -> Option<C> {
        let lock = self.lock_for(tuple);
        if lock.can_grant_write() {
            lock.writer = Some(origin_id);
            Some(on_acquire)
        } else {
            lock.waiters.push_front(Waiter::Write {
                origin_id,
                on_acquire,
            });
            None
        }
    }

    pub fn write_holder(&self, tuple: &EntityTuple) -> Option<u64> {
        self.locks.get(tuple).and_then(|lock| lock.writer)
    }

    /// Number of read grants outstanding on `tuple`, multiplicity included.
    pub fn read_hold_count(&self, tuple: &EntityTuple) -> usize {
        self.locks
            .get(tuple)
            .map(|lock| lock.readers.values().sum())
            .unwrap_or(0)
    }

    pub fn queued_requests(&self, tuple: &EntityTuple) -> usize {
        self.locks
            .get(tuple)
            .map(|lock| lock.waiters.len())
            .unwrap_or(0)
    }
}
