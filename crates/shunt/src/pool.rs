use mio::Token;
use tracing::error;

use crate::conn::{Conn, State};

/// Stable identity of a pool slot for the lifetime of one use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnId(u32);

impl ConnId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub fn from_index(idx: u32) -> Self {
        Self(idx)
    }
}

/// Fixed-capacity slab of connection records with a LIFO free list.
///
/// Slots are created lazily up to `capacity` and then recycled forever, so
/// buffer memory is proportional to peak concurrency. Tokens carry the
/// slot generation so a stale event delivered after a slot was recycled
/// within the same wake-up cannot reach the wrong connection.
pub struct Pool {
    slots: Vec<Conn>,
    free: Vec<u32>,
    gens: Vec<u32>,
    /// True exactly while the slot is out of the free list; every slot is
    /// on one side or the other, never both.
    in_use: Vec<bool>,
    capacity: usize,
    buffer_size: usize,
}

impl Pool {
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            gens: Vec::new(),
            in_use: Vec::new(),
            capacity,
            buffer_size,
        }
    }

    /// O(1): pops the most recently freed slot, or grows the slab while
    /// under capacity. `None` means the pool is exhausted. The caller
    /// assigns role, state and stream to the returned slot.
    pub fn alloc(&mut self) -> Option<ConnId> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize].reset();
            self.in_use[idx as usize] = true;
            return Some(ConnId(idx));
        }
        if self.slots.len() < self.capacity {
            let idx = self.slots.len() as u32;
            self.slots.push(Conn::new(self.buffer_size));
            self.gens.push(0);
            self.in_use.push(true);
            return Some(ConnId(idx));
        }
        None
    }

    /// Returns a disconnected slot to the free list. The slot must already
    /// be unpaired with its fd closed; freeing a slot twice is an invariant
    /// violation and is refused.
    pub fn free(&mut self, id: ConnId) {
        if !self.in_use[id.index()] {
            error!(slot = id.index(), "double free of connection slot");
            return;
        }
        let conn = &mut self.slots[id.index()];
        debug_assert!(conn.stream.is_none());
        debug_assert!(conn.peer.is_none());
        conn.state = State::Closed;
        self.in_use[id.index()] = false;
        self.gens[id.index()] = self.gens[id.index()].wrapping_add(1);
        self.free.push(id.0);
    }

    #[inline]
    pub fn get(&self, id: ConnId) -> &Conn {
        &self.slots[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ConnId) -> &mut Conn {
        &mut self.slots[id.index()]
    }

    /// Disjoint mutable access to a pair of slots.
    pub fn pair_mut(&mut self, a: ConnId, b: ConnId) -> (&mut Conn, &mut Conn) {
        assert_ne!(a, b, "connection cannot pair with itself");
        let (i, j) = (a.index(), b.index());
        if i < j {
            let (left, right) = self.slots.split_at_mut(j);
            (&mut left[i], &mut right[0])
        } else {
            let (left, right) = self.slots.split_at_mut(i);
            (&mut right[0], &mut left[j])
        }
    }

    /// Token for the slot's current use.
    pub fn token(&self, id: ConnId) -> Token {
        Token(((self.gens[id.index()] as usize) << 32) | id.index())
    }

    /// Maps an event token back to a live slot; stale generations and
    /// already-freed slots resolve to `None`.
    pub fn resolve(&self, token: Token) -> Option<ConnId> {
        let idx = (token.0 & 0xffff_ffff) as usize;
        let r#gen = (token.0 >> 32) as u32;
        if idx >= self.slots.len() || self.gens[idx] != r#gen {
            return None;
        }
        self.in_use[idx].then_some(ConnId(idx as u32))
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of in-use slot ids, safe to iterate while closing.
    pub fn live_ids(&self) -> Vec<ConnId> {
        self.in_use
            .iter()
            .enumerate()
            .filter(|(_, live)| **live)
            .map(|(i, _)| ConnId(i as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Role;

    fn pool(cap: usize) -> Pool {
        Pool::with_capacity(cap, 64)
    }

    fn mark_live(pool: &mut Pool, id: ConnId) {
        let conn = pool.get_mut(id);
        conn.role = Role::Client;
        conn.state = State::Connected;
    }

    #[test]
    fn alloc_up_to_capacity_then_none() {
        let mut p = pool(3);
        let ids: Vec<_> = (0..3).map(|_| p.alloc().unwrap()).collect();
        for &id in &ids {
            mark_live(&mut p, id);
        }
        assert!(p.alloc().is_none());
        assert_eq!(p.active(), 3);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut p = pool(4);
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();
        mark_live(&mut p, a);
        mark_live(&mut p, b);

        p.free(a);
        p.free(b);
        // Most recently freed comes back first.
        assert_eq!(p.alloc().unwrap(), b);
        assert_eq!(p.alloc().unwrap(), a);
    }

    #[test]
    fn double_free_refused() {
        let mut p = pool(2);
        let a = p.alloc().unwrap();
        mark_live(&mut p, a);
        p.free(a);
        p.free(a);
        assert_eq!(p.active(), 0);
        // Exactly one free-list entry: two allocs must hand out two
        // distinct slots.
        let x = p.alloc().unwrap();
        let y = p.alloc().unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn counts_sum_to_slots() {
        let mut p = pool(8);
        let ids: Vec<_> = (0..5).map(|_| p.alloc().unwrap()).collect();
        for &id in &ids {
            mark_live(&mut p, id);
        }
        p.free(ids[1]);
        p.free(ids[3]);
        assert_eq!(p.active(), 3);
        assert_eq!(p.live_ids().len(), 3);
        assert!(p.active() <= p.capacity());
    }

    #[test]
    fn stale_token_does_not_resolve() {
        let mut p = pool(2);
        let a = p.alloc().unwrap();
        mark_live(&mut p, a);
        let token = p.token(a);
        assert_eq!(p.resolve(token), Some(a));

        p.free(a);
        assert_eq!(p.resolve(token), None);

        // Recycled slot gets a fresh generation; the old token stays dead.
        let b = p.alloc().unwrap();
        mark_live(&mut p, b);
        assert_eq!(b, a);
        assert_eq!(p.resolve(token), None);
        assert_eq!(p.resolve(p.token(b)), Some(b));
    }

    #[test]
    fn reused_slot_is_reset() {
        let mut p = pool(1);
        let a = p.alloc().unwrap();
        mark_live(&mut p, a);
        p.get_mut(a).read_buf.push(b"junk");
        p.get_mut(a).requests_handled = 7;
        p.free(a);

        let b = p.alloc().unwrap();
        assert_eq!(b, a);
        assert!(p.get(b).read_buf.is_empty());
        assert_eq!(p.get(b).requests_handled, 0);
    }
}
