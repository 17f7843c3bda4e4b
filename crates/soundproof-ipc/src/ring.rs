//! Fixed-capacity byte ring for message bytes, one per direction per
//! sandbox segment.
//!
//! This is a bounded vector with an interior spin lock, not a wait-free
//! queue: only the non-realtime polling threads on either side touch it.
//! `read`/`write` move as many bytes as fit and return the actual count;
//! partial transfers are the transport's backpressure signal. Lock
//! acquisition is bounded so a stalled peer can never wedge a poller — a
//! failed acquisition just transfers zero bytes this poll.

use soundproof_core::MSG_BUFFER_SIZE;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const LOCK_SPIN_LIMIT: u32 = 100_000;

/// One direction of the sandbox message pipe.
#[repr(C)]
pub struct MsgRing {
    lock: AtomicBool,
    len: AtomicU32,
    bytes: UnsafeCell<[u8; MSG_BUFFER_SIZE]>,
}

// Interior lock + atomics make concurrent access safe across processes.
unsafe impl Sync for MsgRing {}

impl MsgRing {
    /// Reset to empty. Called once by the segment creator.
    pub fn init(&self) {
        self.lock.store(false, Ordering::Release);
        self.len.store(0, Ordering::Release);
    }

    fn acquire(&self) -> bool {
        for _ in 0..LOCK_SPIN_LIMIT {
            if self
                .lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Append as many of `src`'s bytes as fit. Returns bytes written.
    pub fn write(&self, src: &[u8]) -> usize {
        if !self.acquire() {
            return 0;
        }
        let len = self.len.load(Ordering::Relaxed) as usize;
        let n = src.len().min(MSG_BUFFER_SIZE - len);
        unsafe {
            let buf = &mut *self.bytes.get();
            buf[len..len + n].copy_from_slice(&src[..n]);
        }
        self.len.store((len + n) as u32, Ordering::Relaxed);
        self.release();
        n
    }

    /// Pop up to `dst.len()` bytes from the front. Returns bytes read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        if !self.acquire() {
            return 0;
        }
        let len = self.len.load(Ordering::Relaxed) as usize;
        let n = dst.len().min(len);
        unsafe {
            let buf = &mut *self.bytes.get();
            dst[..n].copy_from_slice(&buf[..n]);
            buf.copy_within(n..len, 0);
        }
        self.len.store((len - n) as u32, Ordering::Relaxed);
        self.release();
        n
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Box<MsgRing> {
        // Zeroed state is the valid empty state.
        let ring: Box<MsgRing> = unsafe { Box::new_zeroed().assume_init() };
        ring.init();
        ring
    }

    #[test]
    fn test_write_then_read_preserves_order() {
        let ring = fresh();
        assert_eq!(ring.write(b"hello "), 6);
        assert_eq!(ring.write(b"world"), 5);
        let mut out = [0u8; 16];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"hello world");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_partial_read_keeps_remainder() {
        let ring = fresh();
        ring.write(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        let mut rest = [0u8; 8];
        let n = ring.read(&mut rest);
        assert_eq!(&rest[..n], b"ef");
    }

    #[test]
    fn test_write_stops_at_capacity() {
        let ring = fresh();
        let big = vec![7u8; MSG_BUFFER_SIZE + 100];
        assert_eq!(ring.write(&big), MSG_BUFFER_SIZE);
        assert_eq!(ring.write(b"more"), 0);
        let mut drain = vec![0u8; 100];
        ring.read(&mut drain);
        assert_eq!(ring.write(b"more"), 4);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring: &'static MsgRing = Box::leak(fresh());
        let total = 64 * 1024_usize;
        let producer = std::thread::spawn(move || {
            let payload = [0xAB_u8; 97];
            let mut sent = 0;
            while sent < total {
                let want = payload.len().min(total - sent);
                sent += ring.write(&payload[..want]);
            }
        });
        let mut received = 0;
        let mut buf = [0u8; 128];
        while received < total {
            let n = ring.read(&mut buf);
            assert!(buf[..n].iter().all(|&b| b == 0xAB));
            received += n;
        }
        producer.join().unwrap();
    }
}
