//! Bounded hardware-mark allocators.
//!
//! Every object the forwarding engine knows about is identified by a small
//! integer ("mark") drawn from a fixed-size pool. A fresh pool hands out ids
//! in ascending order; released ids join the tail of the free list, so a mark
//! is reused as late as possible.

use std::collections::VecDeque;
use thiserror::Error;

/// Allocator errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    #[error("counter overflow")]
    Overflow,

    #[error("counter id out of range: {0}")]
    Range(u32),

    #[error("counter id not allocated: {0}")]
    NotAllocated(u32),
}

pub type Result<T> = std::result::Result<T, CounterError>;

/// A pool of `len` ids starting at `begin`.
#[derive(Debug, Clone)]
pub struct Counter {
    begin: u32,
    len: u32,
    free: VecDeque<u32>,
    used: Vec<bool>,
}

impl Counter {
    /// Create a pool covering `[begin, begin + len)`.
    pub fn new(begin: u32, len: u32) -> Self {
        Self {
            begin,
            len,
            free: (0..len).collect(),
            used: vec![false; len as usize],
        }
    }

    /// Take the next free id.
    pub fn get(&mut self) -> Result<u32> {
        let slot = self.free.pop_front().ok_or(CounterError::Overflow)?;
        self.used[slot as usize] = true;
        Ok(self.begin + slot)
    }

    /// Return an id to the pool.
    pub fn put(&mut self, id: u32) -> Result<()> {
        if id < self.begin || id >= self.begin + self.len {
            return Err(CounterError::Range(id));
        }
        let slot = id - self.begin;
        if !self.used[slot as usize] {
            return Err(CounterError::NotAllocated(id));
        }
        self.used[slot as usize] = false;
        self.free.push_back(slot);
        Ok(())
    }

    /// Number of ids still available.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total pool size.
    pub fn capacity(&self) -> u32 {
        self.len
    }

    /// Check whether `id` is currently handed out.
    pub fn is_allocated(&self, id: u32) -> bool {
        id >= self.begin
            && id < self.begin + self.len
            && self.used[(id - self.begin) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_sequential() {
        let mut c = Counter::new(1, 4);
        assert_eq!(c.get().unwrap(), 1);
        assert_eq!(c.get().unwrap(), 2);
        assert_eq!(c.get().unwrap(), 3);
        assert_eq!(c.available(), 1);
    }

    #[test]
    fn test_counter_exhaustion() {
        let mut c = Counter::new(2049, 2);
        assert_eq!(c.get().unwrap(), 2049);
        assert_eq!(c.get().unwrap(), 2050);
        assert_eq!(c.get(), Err(CounterError::Overflow));
        // Failed allocation leaves the pool untouched
        assert_eq!(c.available(), 0);
        c.put(2049).unwrap();
        assert_eq!(c.get().unwrap(), 2049);
    }

    #[test]
    fn test_counter_recycles_fifo() {
        let mut c = Counter::new(0, 3);
        let a = c.get().unwrap();
        let b = c.get().unwrap();
        c.put(a).unwrap();
        // 2 was never handed out and sits ahead of the released id
        assert_eq!(c.get().unwrap(), 2);
        assert_eq!(c.get().unwrap(), a);
        c.put(b).unwrap();
        assert_eq!(c.get().unwrap(), b);
    }

    #[test]
    fn test_counter_put_errors() {
        let mut c = Counter::new(10, 2);
        assert_eq!(c.put(9), Err(CounterError::Range(9)));
        assert_eq!(c.put(12), Err(CounterError::Range(12)));
        assert_eq!(c.put(10), Err(CounterError::NotAllocated(10)));

        let id = c.get().unwrap();
        assert!(c.is_allocated(id));
        c.put(id).unwrap();
        assert_eq!(c.put(id), Err(CounterError::NotAllocated(id)));
    }
}
