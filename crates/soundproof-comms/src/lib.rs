//! Lockless communication primitives for audio-thread-safe publication.
//!
//! The centerpiece is [`AudioSync`], the copy-on-write publisher used for
//! both the client's topology model and each sandbox's local device model:
//! writers mutate a working copy under a mutex and publish immutable
//! `Arc` snapshots through a triple buffer; the audio thread picks up the
//! latest snapshot without taking any lock. Retired snapshots stay alive in
//! a version list until a low-frequency garbage collection observes that no
//! reader can still hold them.

pub use crossbeam_channel;
pub use rtrb;
pub use triple_buffer;

use parking_lot::Mutex;
use std::sync::Arc;

/// Writer half of the snapshot publisher.
pub struct AudioSync<T: Clone + Send + Sync> {
    inner: Mutex<Writer<T>>,
}

struct Writer<T: Send + Sync> {
    data: T,
    input: triple_buffer::Input<Arc<T>>,
    versions: Vec<Arc<T>>,
}

/// Reader half. Owned by (exactly) the audio thread.
pub struct AudioSnapshots<T: Send + Sync> {
    output: triple_buffer::Output<Arc<T>>,
}

impl<T: Clone + Send + Sync> AudioSync<T> {
    pub fn new(initial: T) -> (Self, AudioSnapshots<T>) {
        let first = Arc::new(initial.clone());
        let (input, output) = triple_buffer::TripleBuffer::new(&first).split();
        let sync = Self {
            inner: Mutex::new(Writer {
                data: initial,
                input,
                versions: vec![first],
            }),
        };
        (sync, AudioSnapshots { output })
    }

    /// Mutate the working copy and publish the result as a new snapshot.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut writer = self.inner.lock();
        let result = f(&mut writer.data);
        let snapshot = Arc::new(writer.data.clone());
        writer.input.write(Arc::clone(&snapshot));
        writer.versions.push(snapshot);
        result
    }

    /// Read the working copy without publishing. Non-realtime callers only.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().data)
    }

    /// Drop retired snapshots that no reader can still observe.
    ///
    /// A version is retired once its only strong reference is the version
    /// list itself; the triple buffer and the audio thread pin everything
    /// that might still become visible. Returns the number of versions
    /// collected.
    pub fn garbage_collect(&self) -> usize {
        let mut writer = self.inner.lock();
        let before = writer.versions.len();
        writer.versions.retain(|v| Arc::strong_count(v) > 1);
        before - writer.versions.len()
    }

    /// Number of snapshot versions currently kept alive.
    pub fn version_count(&self) -> usize {
        self.inner.lock().versions.len()
    }
}

impl<T: Send + Sync> AudioSnapshots<T> {
    /// Latest published snapshot. Lock-free; safe on the audio thread.
    pub fn read(&mut self) -> Arc<T> {
        Arc::clone(self.output.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sees_published_snapshot() {
        let (sync, mut snaps) = AudioSync::new(vec![1]);
        sync.modify(|v| v.push(2));
        assert_eq!(*snaps.read(), vec![1, 2]);
    }

    #[test]
    fn test_working_copy_reads() {
        let (sync, _snaps) = AudioSync::new(0_i32);
        sync.modify(|v| *v = 41);
        sync.modify(|v| *v += 1);
        assert_eq!(sync.with(|v| *v), 42);
    }

    #[test]
    fn test_gc_reclaims_unreferenced_versions() {
        let (sync, mut snaps) = AudioSync::new(0_u64);
        for i in 0..32 {
            sync.modify(|v| *v = i);
        }
        // Cycle the reader so stale triple-buffer slots get overwritten.
        let latest = snaps.read();
        let collected = sync.garbage_collect();
        assert!(collected > 0, "expected some retired versions to be collected");
        // The published snapshot is never collected while the reader holds it.
        assert_eq!(*latest, 31);
        assert!(sync.version_count() >= 1);
    }

    #[test]
    fn test_reader_on_another_thread() {
        let (sync, mut snaps) = AudioSync::new(0_i64);
        let writer = std::thread::spawn(move || {
            for i in 1..=100 {
                sync.modify(|v| *v = i);
            }
            sync
        });
        let mut last = 0;
        while last < 100 {
            let snap = snaps.read();
            assert!(*snap >= last, "snapshots must be monotonic here");
            last = *snap;
        }
        writer.join().unwrap();
    }
}
