//! Per-key serialization queue.
//!
//! At most one entry per key is admitted at any instant; everything else for that key
//! waits in arrival order. Different keys never interact.
//!
//! Waiters live in a single arena (`Vec` of slots plus a free list) and each key keeps a
//! singly linked FIFO through it, so enqueue and release are O(1) and no per-key
//! allocation survives once a key goes idle.
//!
//! Admission is represented by a [`Ticket`]. Releasing requires the holder's ticket, which
//! makes a second or stale release a no-op instead of admitting someone early.

use std::collections::HashMap;

use crate::protocol::LockKey;

/// Proof of a place in a key's queue. Only the admitted ticket can release the key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Outcome of [`KeyQueue::enqueue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// The key was idle; the caller holds it now.
    Admitted(Ticket),
    /// The key is held; `position` entries (1-based) are ahead including the holder.
    Waiting { ticket: Ticket, position: usize },
}

impl Enqueued {
    #[must_use]
    pub const fn ticket(self) -> Ticket {
        match self {
            Self::Admitted(ticket) | Self::Waiting { ticket, .. } => ticket,
        }
    }
}

/// The next waiter handed the key by [`KeyQueue::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission<T> {
    pub ticket: Ticket,
    pub item: T,
}

#[derive(Debug)]
struct Waiter<T> {
    ticket: Ticket,
    item: T,
    next: Option<usize>,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(Waiter<T>),
    Free { next: Option<usize> },
}

#[derive(Debug)]
struct Lane {
    holder: Ticket,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// FIFO admission queue per lock key.
#[derive(Debug)]
pub struct KeyQueue<T> {
    lanes: HashMap<LockKey, Lane>,
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    next_ticket: u64,
}

impl<T> Default for KeyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> KeyQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lanes: HashMap::new(),
            slots: Vec::new(),
            free_head: None,
            next_ticket: 0,
        }
    }

    /// Queue `item` for `key`. Admitted immediately when the key is idle.
    pub fn enqueue(&mut self, key: &LockKey, item: T) -> Enqueued {
        let ticket = self.issue_ticket();

        if !self.lanes.contains_key(key) {
            self.lanes.insert(
                key.clone(),
                Lane {
                    holder: ticket,
                    head: None,
                    tail: None,
                    len: 0,
                },
            );
            return Enqueued::Admitted(ticket);
        }

        let idx = self.alloc(Waiter {
            ticket,
            item,
            next: None,
        });
        let previous_tail = self.lanes.get_mut(key).and_then(|lane| {
            let previous = lane.tail.replace(idx);
            if lane.head.is_none() {
                lane.head = Some(idx);
            }
            lane.len += 1;
            previous
        });
        if let Some(Slot::Occupied(waiter)) = previous_tail.and_then(|t| self.slots.get_mut(t)) {
            waiter.next = Some(idx);
        }

        let position = self.lanes.get(key).map_or(1, |lane| lane.len);
        Enqueued::Waiting { ticket, position }
    }

    /// Release `key` held by `ticket` and admit the next waiter, if any.
    ///
    /// Returns `None` when the key becomes idle, or when `ticket` does not currently hold
    /// the key (already released, stale, or still waiting).
    pub fn release(&mut self, key: &LockKey, ticket: Ticket) -> Option<Admission<T>> {
        let lane = self.lanes.get_mut(key)?;
        if lane.holder != ticket {
            return None;
        }

        let Some(head) = lane.head else {
            self.lanes.remove(key);
            return None;
        };

        let waiter = self.take(head)?;
        if let Some(lane) = self.lanes.get_mut(key) {
            lane.head = waiter.next;
            if lane.head.is_none() {
                lane.tail = None;
            }
            lane.len = lane.len.saturating_sub(1);
            lane.holder = waiter.ticket;
        }
        Some(Admission {
            ticket: waiter.ticket,
            item: waiter.item,
        })
    }

    /// Ticket currently admitted for `key`.
    #[must_use]
    pub fn holder(&self, key: &LockKey) -> Option<Ticket> {
        self.lanes.get(key).map(|lane| lane.holder)
    }

    /// Number of entries waiting behind the holder of `key`.
    #[must_use]
    pub fn waiting(&self, key: &LockKey) -> usize {
        self.lanes.get(key).map_or(0, |lane| lane.len)
    }

    /// Number of keys with an admitted holder.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.lanes.len()
    }

    /// Items waiting for `key`, front first.
    pub fn waiters<'a>(&'a self, key: &LockKey) -> impl Iterator<Item = &'a T> + 'a {
        let mut cursor = self.lanes.get(key).and_then(|lane| lane.head);
        std::iter::from_fn(move || {
            let idx = cursor?;
            match self.slots.get(idx) {
                Some(Slot::Occupied(waiter)) => {
                    cursor = waiter.next;
                    Some(&waiter.item)
                }
                _ => None,
            }
        })
    }

    fn issue_ticket(&mut self) -> Ticket {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket = self.next_ticket.wrapping_add(1);
        ticket
    }

    fn alloc(&mut self, waiter: Waiter<T>) -> usize {
        match self.free_head {
            Some(idx) => {
                self.free_head = match self.slots.get(idx) {
                    Some(Slot::Free { next }) => *next,
                    _ => None,
                };
                if let Some(slot) = self.slots.get_mut(idx) {
                    *slot = Slot::Occupied(waiter);
                }
                idx
            }
            None => {
                self.slots.push(Slot::Occupied(waiter));
                self.slots.len() - 1
            }
        }
    }

    fn take(&mut self, idx: usize) -> Option<Waiter<T>> {
        let slot = self.slots.get_mut(idx)?;
        match std::mem::replace(
            slot,
            Slot::Free {
                next: self.free_head,
            },
        ) {
            Slot::Occupied(waiter) => {
                self.free_head = Some(idx);
                Some(waiter)
            }
            free @ Slot::Free { .. } => {
                *slot = free;
                None
            }
        }
    }
}
