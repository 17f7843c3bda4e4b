//! Indexed store handing out correlation tokens for in-flight async
//! replies.
//!
//! `put` parks a value (usually a boxed continuation) and returns its slot
//! index as the token; `take` consumes it when the reply arrives. Tokens
//! are never reused while outstanding. The growable variant doubles its
//! capacity on exhaustion; the fixed variant blocks the caller until a slot
//! frees up.

use parking_lot::{Condvar, Mutex};

struct Slots<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    growable: bool,
}

impl<T> Slots<T> {
    fn with_capacity(capacity: usize, growable: bool) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            growable,
        }
    }

    fn grow(&mut self) {
        let old = self.slots.len();
        let extra = old.max(1);
        self.slots.extend((0..extra).map(|_| None));
        self.free.extend((old..old + extra).rev());
    }

    /// Store `value`, or hand it back when the buffer is full and fixed.
    fn try_put(&mut self, value: T) -> Result<u64, T> {
        if self.free.is_empty() {
            if !self.growable {
                return Err(value);
            }
            self.grow();
        }
        let index = self.free.pop().expect("free list refilled above");
        self.slots[index] = Some(value);
        Ok(index as u64)
    }

    fn take(&mut self, token: u64) -> Option<T> {
        let index = token as usize;
        let value = self.slots.get_mut(index)?.take();
        if value.is_some() {
            self.free.push(index);
        }
        value
    }
}

pub struct SlotBuffer<T> {
    inner: Mutex<Slots<T>>,
    freed: Condvar,
}

impl<T> SlotBuffer<T> {
    const DEFAULT_CAPACITY: usize = 32;

    /// A buffer that doubles its capacity when full.
    pub fn growable() -> Self {
        Self {
            inner: Mutex::new(Slots::with_capacity(Self::DEFAULT_CAPACITY, true)),
            freed: Condvar::new(),
        }
    }

    /// A buffer with a hard capacity; `put` blocks while full.
    pub fn fixed(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slots::with_capacity(capacity, false)),
            freed: Condvar::new(),
        }
    }

    /// Store `value` and return its token. Blocks on a full fixed buffer.
    pub fn put(&self, value: T) -> u64 {
        let mut inner = self.inner.lock();
        let mut value = value;
        loop {
            match inner.try_put(value) {
                Ok(token) => return token,
                Err(returned) => {
                    value = returned;
                    self.freed.wait(&mut inner);
                }
            }
        }
    }

    /// Consume the value stored under `token`, if any.
    pub fn take(&self, token: u64) -> Option<T> {
        let value = self.inner.lock().take(token);
        if value.is_some() {
            self.freed.notify_one();
        }
        value
    }

    /// Tokens currently outstanding.
    pub fn outstanding(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    /// Drain every outstanding value (used when a sandbox dies and its
    /// pending continuations must be failed).
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for index in 0..inner.slots.len() {
            if let Some(value) = inner.slots[index].take() {
                inner.free.push(index);
                out.push(value);
            }
        }
        self.freed.notify_all();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_returns_what_put_stored() {
        let buf = SlotBuffer::growable();
        let token = buf.put("hello");
        assert_eq!(buf.take(token), Some("hello"));
        assert_eq!(buf.take(token), None);
    }

    #[test]
    fn test_tokens_unique_while_outstanding() {
        let buf = SlotBuffer::growable();
        let tokens: Vec<u64> = (0..100).map(|i| buf.put(i)).collect();
        let mut sorted = tokens.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            assert_eq!(buf.take(*token), Some(i));
        }
        assert_eq!(buf.outstanding(), 0);
    }

    #[test]
    fn test_growable_grows_past_initial_capacity() {
        let buf = SlotBuffer::growable();
        let tokens: Vec<u64> = (0..1000).map(|i| buf.put(i)).collect();
        assert_eq!(buf.outstanding(), 1000);
        assert_eq!(buf.take(tokens[999]), Some(999));
    }

    #[test]
    fn test_fixed_blocks_until_slot_frees() {
        let buf = Arc::new(SlotBuffer::fixed(2));
        let t0 = buf.put(0);
        let _t1 = buf.put(1);
        let waiter = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || buf.put(2))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(buf.take(t0), Some(0));
        let t2 = waiter.join().unwrap();
        assert_eq!(buf.take(t2), Some(2));
    }

    #[test]
    fn test_drain_empties_everything() {
        let buf = SlotBuffer::growable();
        buf.put(1);
        buf.put(2);
        let mut drained = buf.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(buf.outstanding(), 0);
    }
}
