//! Readiness token allocation for the reactor.
//!
//! Each registered event source gets a mio `Token` that packs a slab key and a
//! generation counter. The generation guards against a stale readiness event
//! being delivered to whatever was registered next in a recycled slot.

use mio::Token;
use slab::Slab;

const GENERATION_SHIFT: u32 = usize::BITS / 2;
const KEY_MASK: usize = (1 << GENERATION_SHIFT) - 1;

/// Stable identifier of a registered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub(crate) Token);

impl EventHandle {
    /// The raw mio token.
    pub fn token(self) -> Token {
        self.0
    }
}

struct Slot<T> {
    generation: usize,
    /// `None` while the entry is checked out for dispatch.
    entry: Option<T>,
}

/// Allocator for event tokens with O(1) lookup.
///
/// Entries can be checked out while their callback runs and restored
/// afterwards; freeing a checked-out slot makes the restore a no-op.
pub struct TokenAllocator<T> {
    slots: Slab<Slot<T>>,
    next_generation: usize,
}

impl<T> TokenAllocator<T> {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            next_generation: 0,
        }
    }

    /// Allocate a new token for an entry.
    pub fn alloc(&mut self, entry: T) -> EventHandle {
        let generation = self.next_generation;
        self.next_generation = (self.next_generation + 1) & KEY_MASK;
        let key = self.slots.insert(Slot {
            generation,
            entry: Some(entry),
        });
        debug_assert!(key <= KEY_MASK, "token slab overflow");
        EventHandle(Token((generation << GENERATION_SHIFT) | key))
    }

    /// The handle the next [`alloc`](Self::alloc) will return.
    pub fn next_handle(&self) -> EventHandle {
        let key = self.slots.vacant_key();
        EventHandle(Token((self.next_generation << GENERATION_SHIFT) | key))
    }

    fn slot_mut(&mut self, handle: EventHandle) -> Option<&mut Slot<T>> {
        let (key, generation) = split(handle.0);
        self.slots
            .get_mut(key)
            .filter(|slot| slot.generation == generation)
    }

    /// Check an entry out for dispatch.
    ///
    /// Returns `None` if the token is stale, freed, or already checked out.
    pub fn take(&mut self, handle: EventHandle) -> Option<T> {
        self.slot_mut(handle).and_then(|slot| slot.entry.take())
    }

    /// Return a checked-out entry.
    ///
    /// Hands the entry back if its slot was freed in the meantime, so the
    /// caller decides when it is dropped.
    pub fn restore(&mut self, handle: EventHandle, entry: T) -> Option<T> {
        match self.slot_mut(handle) {
            Some(slot) if slot.entry.is_none() => {
                slot.entry = Some(entry);
                None
            }
            _ => Some(entry),
        }
    }

    /// Free a token, making its slot available for reuse.
    ///
    /// Returns the entry unless it is currently checked out.
    pub fn free(&mut self, handle: EventHandle) -> Option<T> {
        let (key, generation) = split(handle.0);
        match self.slots.get(key) {
            Some(slot) if slot.generation == generation => self.slots.remove(key).entry,
            _ => None,
        }
    }

    /// Whether the token still refers to a live slot.
    pub fn contains(&self, handle: EventHandle) -> bool {
        let (key, generation) = split(handle.0);
        self.slots
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if there are no allocated tokens.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

fn split(token: Token) -> (usize, usize) {
    (token.0 & KEY_MASK, token.0 >> GENERATION_SHIFT)
}
