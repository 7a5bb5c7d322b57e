/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of IBFS.
 *
 * IBFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * IBFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * IBFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Single-writer I/O queue.
//!
//! Every physical access to the volume file goes through a lease taken from
//! the queue. Leases are granted strictly in acquisition order, one at a
//! time, which serializes reads and writes on the file.
//!
//! A lease expires after a fixed timeout counted from its grant. An expired
//! lease no longer protects anything: the queue advances over it so one stuck
//! holder cannot wedge the volume, and the holder learns about it when its
//! `release` comes back with a timeout.
//!
//! Grants are driven by an iterative scan of the wait list; there is no
//! recursive hand-off from one holder to the next, so arbitrarily long
//! convoys complete in constant stack space.

use crate::error::ErrorKind;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

/// Default lease timeout.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_millis(3000);

/// The holder currently granted the queue.
#[derive(Debug)]
struct Active {
    id: u64,
    deadline: Instant,
}

#[derive(Debug)]
struct State {
    /// Identifier handed to the next acquirer.
    next_id: u64,
    /// Waiting acquirers, in arrival order.
    pending: VecDeque<u64>,
    /// The current holder, if any.
    active: Option<Active>,
    /// Holders the queue advanced over before they released.
    expired: Vec<u64>,
}

/// A FIFO queue of expirable I/O leases.
#[derive(Debug)]
pub struct IoQueue {
    state: Mutex<State>,
    cond: Condvar,
    timeout: Duration,
}

impl IoQueue {
    /// Creates a queue with the default lease timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LEASE_TIMEOUT)
    }

    /// Creates a queue with the given lease timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                pending: VecDeque::new(),
                active: None,
                expired: Vec::new(),
            }),
            cond: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires a lease, waiting for every earlier acquirer to release or
    /// expire first.
    pub fn acquire(&self) -> Lease<'_> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push_back(id);

        loop {
            let now = Instant::now();
            // Advance over an expired holder
            let stale = match &state.active {
                Some(active) if now >= active.deadline => Some(active.id),
                _ => None,
            };
            if let Some(stale) = stale {
                state.expired.push(stale);
                state.active = None;
                self.cond.notify_all();
            }
            if state.active.is_none() && state.pending.front() == Some(&id) {
                state.pending.pop_front();
                state.active = Some(Active {
                    id,
                    deadline: now + self.timeout,
                });
                return Lease {
                    queue: self,
                    id,
                    released: false,
                };
            }
            let wait = state
                .active
                .as_ref()
                .map(|active| active.deadline.saturating_duration_since(now));
            state = match wait {
                Some(wait) => {
                    self.cond
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Releases the lease with the given identifier.
    fn finish(&self, id: u64) -> Result<()> {
        let mut state = self.lock();
        if let Some(pos) = state.expired.iter().position(|e| *e == id) {
            state.expired.swap_remove(pos);
            return Err(ErrorKind::LeaseTimedOut.into());
        }
        let Some(active) = &state.active else {
            return Ok(());
        };
        if active.id != id {
            return Ok(());
        }
        let timed_out = Instant::now() >= active.deadline;
        state.active = None;
        drop(state);
        self.cond.notify_all();
        if timed_out {
            return Err(ErrorKind::LeaseTimedOut.into());
        }
        Ok(())
    }

    /// Tells whether the lease with the given identifier has expired.
    fn is_expired(&self, id: u64) -> bool {
        let state = self.lock();
        if state.expired.contains(&id) {
            return true;
        }
        match &state.active {
            Some(active) if active.id == id => Instant::now() >= active.deadline,
            _ => false,
        }
    }
}

impl Default for IoQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A granted lease.
///
/// Dropping the lease releases it silently; call [`Lease::release`] to learn
/// whether the lease was still live.
pub struct Lease<'q> {
    queue: &'q IoQueue,
    id: u64,
    released: bool,
}

impl Lease<'_> {
    /// Releases the lease.
    ///
    /// Returns a timeout error if the lease expired before the release, in
    /// which case the queue has already moved on and whatever the holder did
    /// after the deadline was no longer serialized.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.queue.finish(self.id)
    }

    /// Tells whether the lease has expired.
    pub fn expired(&self) -> bool {
        self.queue.is_expired(self.id)
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.queue.finish(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sequential_grants() {
        let queue = IoQueue::new();
        for _ in 0..100 {
            let lease = queue.acquire();
            assert!(!lease.expired());
            lease.release().unwrap();
        }
    }

    #[test]
    fn fifo_order() {
        let queue = Arc::new(IoQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Pin the queue so spawned threads line up behind us
        let gate = queue.acquire();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let queue_check = Arc::clone(&queue);
                let order = Arc::clone(&order);
                let handle = thread::spawn(move || {
                    let lease = queue.acquire();
                    order.lock().unwrap().push(i);
                    lease.release().unwrap();
                });
                // Let the thread reach the queue before spawning the next one
                while queue_check.lock().pending.len() != i + 1 {
                    thread::yield_now();
                }
                handle
            })
            .collect();
        gate.release().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn expired_lease_reports_timeout() {
        let queue = IoQueue::with_timeout(Duration::from_millis(10));
        let stuck = queue.acquire();
        thread::sleep(Duration::from_millis(30));

        // The queue advances over the stuck holder
        let next = queue.acquire();
        assert!(!next.expired());
        next.release().unwrap();

        let err = stuck.release().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseTimedOut);
    }

    #[test]
    fn late_release_without_waiter_times_out() {
        let queue = IoQueue::with_timeout(Duration::from_millis(10));
        let lease = queue.acquire();
        thread::sleep(Duration::from_millis(30));
        assert!(lease.expired());

        let err = lease.release().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseTimedOut);

        // The queue stays serviceable
        queue.acquire().release().unwrap();
    }
}
