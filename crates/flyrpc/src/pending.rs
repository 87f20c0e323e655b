//! # Pending Table
//!
//! Outstanding requests keyed by sequence number.
//!
//! ## Invariants
//! - **Exactly One Resolution**: an entry leaves the table exactly once, through
//!   `complete`, `Pending::cancel` or `drain`. Whoever removes it owns the outcome.
//! - **No Live Collisions**: sequence numbers wrap, but a number still in the table
//!   is never handed out again. Zero is never handed out.
//! - **Abandoned Entries Leave**: dropping a [`Pending`] removes its entry, so a
//!   caller that stops waiting never holds a slot.
//! - **Hard Bound**: at most `max_pending` entries exist at once, even under
//!   concurrent `register` calls.

use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;

struct Slot<T> {
    /// Tells this registration apart from a later one that reuses the number.
    ticket: u64,
    tx: oneshot::Sender<T>,
}

pub(crate) struct PendingTable<T> {
    entries: DashMap<u16, Slot<T>>,
    seq_gen: AtomicU16,
    tickets: AtomicU64,
    reserved: AtomicUsize,
    max_pending: usize,
}

impl<T> PendingTable<T> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: DashMap::new(),
            seq_gen: AtomicU16::new(1),
            tickets: AtomicU64::new(0),
            reserved: AtomicUsize::new(0),
            max_pending: max_pending.min(u16::MAX as usize),
        }
    }

    /// Next sequence number, without registering it.
    pub fn next_seq(&self) -> u16 {
        loop {
            let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Claims a free sequence number and the receiver its resolution arrives on.
    pub fn register(&self) -> Result<Pending<'_, T>> {
        let max = self.max_pending;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| Error::TooManyPending)?;

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        for _ in 0..u16::MAX {
            let seq = self.next_seq();
            if let Entry::Vacant(slot) = self.entries.entry(seq) {
                let (tx, rx) = oneshot::channel();
                slot.insert(Slot { ticket, tx });
                return Ok(Pending { table: self, seq, ticket, rx });
            }
        }

        self.release();
        Err(Error::TooManyPending)
    }

    /// Resolves an entry. Returns false if nothing was waiting on `seq`.
    pub fn complete(&self, seq: u16, value: T) -> bool {
        match self.entries.remove(&seq) {
            Some((_, slot)) => {
                self.release();
                // the waiter may have given up already
                let _ = slot.tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Resolves every entry with a value from `make`.
    pub fn drain(&self, make: impl Fn() -> T) {
        let keys: Vec<u16> = self.entries.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.complete(key, make());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn forget(&self, seq: u16, ticket: u64) -> bool {
        let removed = self.entries.remove_if(&seq, |_, slot| slot.ticket == ticket).is_some();
        if removed {
            self.release();
        }
        removed
    }

    fn release(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub fn contains(&self, seq: u16) -> bool {
        self.entries.contains_key(&seq)
    }
}

/// One registered entry and the receiver it resolves on.
///
/// Dropping it removes the entry if it is still waiting.
pub(crate) struct Pending<'a, T> {
    table: &'a PendingTable<T>,
    seq: u16,
    ticket: u64,
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<'_, T> {
    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn receiver(&mut self) -> &mut oneshot::Receiver<T> {
        &mut self.rx
    }

    /// Removes the entry. Returns false if it was already resolved, in which
    /// case the value is on its way to the receiver.
    pub fn cancel(&self) -> bool {
        self.table.forget(self.seq, self.ticket)
    }
}

impl<T> Drop for Pending<'_, T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
