//! Group signaling: the "start processing" and "processing done" events.
//!
//! Two logical events exist per group. The client fires "start" once per
//! buffer after publishing a new epoch; every sandbox worker wakes on it.
//! The last sandbox to decrement the fan-in counter fires "done". Either
//! side can also signal *itself* to bail out of a wait during shutdown;
//! waiters therefore always re-check the epoch and treat a wake without
//! epoch progress as spurious.
//!
//! Platform realizations, picked at build time:
//! - Linux: a futex word per event inside the group segment.
//! - macOS: named POSIX semaphores derived from the group shmid.

use crate::IpcError;
use crate::layout::GroupShmData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a sandbox waiting for the start event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSignaledResult {
    Signaled,
    StopRequested,
    Timeout,
}

/// Outcome of the client waiting for the fan-in counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDoneResult {
    Done,
    NotResponding,
}

/// Which side of the group this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSide {
    Client,
    Sandbox,
}

const SPIN_BUDGET: Duration = Duration::from_micros(100);

/// Hybrid wait: spin briefly, then poll with escalating micro-sleeps.
/// Returns true if `done` became true before the deadline.
fn spin_then_sleep_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    let mut sleep_us = 1u64;
    loop {
        if done() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return done();
        }
        if now - start < SPIN_BUDGET {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_micros(sleep_us));
            sleep_us = (sleep_us * 2).min(100);
        }
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Signaling fields embedded in the group segment.
    #[repr(C)]
    #[derive(Default)]
    pub struct SignalWords {
        pub(super) signal_sandboxes: AtomicU32,
        pub(super) signal_client: AtomicU32,
    }

    /// Per-process signaling state. Futexes live entirely in shared memory,
    /// so there is nothing local to hold.
    pub struct GroupSignals;

    impl GroupSignals {
        pub fn init(_side: SignalSide, _group_shmid: &str) -> Result<Self, IpcError> {
            Ok(Self)
        }
    }

    fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(t.subsec_nanos()),
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), std::ptr::from_ref);
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0,
            );
        }
    }

    fn futex_wake_all(word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                libc::c_int::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0,
            );
        }
    }

    pub(super) fn set_sandboxes(words: &SignalWords, _signals: &GroupSignals) {
        words.signal_sandboxes.store(1, Ordering::Release);
        futex_wake_all(&words.signal_sandboxes);
    }

    pub(super) fn set_client(words: &SignalWords, _signals: &GroupSignals) {
        words.signal_client.store(1, Ordering::Release);
        futex_wake_all(&words.signal_client);
    }

    /// Block until the sandbox-start event fires or `slice` elapses, then
    /// consume it.
    pub(super) fn wait_sandboxes(words: &SignalWords, _signals: &GroupSignals, slice: Duration) {
        if words.signal_sandboxes.load(Ordering::Acquire) == 0 {
            futex_wait(&words.signal_sandboxes, 0, Some(slice));
        }
        words.signal_sandboxes.store(0, Ordering::Release);
    }

    pub(super) fn wait_client(words: &SignalWords, _signals: &GroupSignals, slice: Duration) {
        if words.signal_client.load(Ordering::Acquire) == 0 {
            futex_wait(&words.signal_client, 0, Some(slice));
        }
        words.signal_client.store(0, Ordering::Release);
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::*;
    use std::ffi::CString;

    /// No shared fields needed; the semaphores are named.
    #[repr(C)]
    #[derive(Default)]
    pub struct SignalWords;

    pub struct GroupSignals {
        sem_sandboxes: *mut libc::sem_t,
        sem_client: *mut libc::sem_t,
        /// Set on the creating (client) side; unlinks the names on drop.
        owned_names: Option<(CString, CString)>,
    }

    unsafe impl Send for GroupSignals {}
    unsafe impl Sync for GroupSignals {}

    /// Names are capped well below PSEMNAMLEN, so hash the shmid instead of
    /// embedding it.
    fn sem_name(prefix: &str, group_shmid: &str) -> CString {
        let mut hash = 0xcbf2_9ce4_8422_2325_u64;
        for b in group_shmid.bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        CString::new(format!("/sp-{prefix}-{hash:016x}")).expect("no interior nul")
    }

    impl GroupSignals {
        pub fn init(side: SignalSide, group_shmid: &str) -> Result<Self, IpcError> {
            let name_s = sem_name("s", group_shmid);
            let name_c = sem_name("c", group_shmid);
            let (sem_sandboxes, sem_client) = unsafe {
                match side {
                    SignalSide::Client => {
                        let s = libc::sem_open(name_s.as_ptr(), libc::O_CREAT, 0o600, 0);
                        let c = libc::sem_open(name_c.as_ptr(), libc::O_CREAT, 0o600, 0);
                        (s, c)
                    }
                    SignalSide::Sandbox => {
                        let s = libc::sem_open(name_s.as_ptr(), 0);
                        let c = libc::sem_open(name_c.as_ptr(), 0);
                        (s, c)
                    }
                }
            };
            if sem_sandboxes == libc::SEM_FAILED || sem_client == libc::SEM_FAILED {
                return Err(IpcError::Signal(format!(
                    "sem_open failed for group {group_shmid:?}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let owned_names = (side == SignalSide::Client).then_some((name_s, name_c));
            Ok(Self { sem_sandboxes, sem_client, owned_names })
        }
    }

    impl Drop for GroupSignals {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem_sandboxes);
                libc::sem_close(self.sem_client);
                if let Some((name_s, name_c)) = self.owned_names.take() {
                    libc::sem_unlink(name_s.as_ptr());
                    libc::sem_unlink(name_c.as_ptr());
                }
            }
        }
    }

    pub(super) fn set_sandboxes(_words: &SignalWords, signals: &GroupSignals) {
        unsafe {
            libc::sem_post(signals.sem_sandboxes);
        }
    }

    pub(super) fn set_client(_words: &SignalWords, signals: &GroupSignals) {
        unsafe {
            libc::sem_post(signals.sem_client);
        }
    }

    fn sem_wait_slice(sem: *mut libc::sem_t, slice: Duration) {
        // macOS has no sem_timedwait; poll with short sleeps.
        let deadline = Instant::now() + slice;
        loop {
            if unsafe { libc::sem_trywait(sem) } == 0 {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    pub(super) fn wait_sandboxes(_words: &SignalWords, signals: &GroupSignals, slice: Duration) {
        sem_wait_slice(signals.sem_sandboxes, slice);
    }

    pub(super) fn wait_client(_words: &SignalWords, signals: &GroupSignals, slice: Duration) {
        sem_wait_slice(signals.sem_client, slice);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("soundproof group signaling is only implemented for Linux and macOS");

pub use imp::{GroupSignals, SignalWords};

/// Publish a new epoch and wake every sandbox in the group.
pub fn signal_sandbox_processing(
    data: &GroupShmData,
    signals: &GroupSignals,
    sandbox_count: u32,
    epoch: u64,
) {
    // Counter first; the epoch store is what sandboxes key on.
    data.sandboxes_processing.store(sandbox_count, Ordering::Release);
    data.epoch.store(epoch, Ordering::Release);
    imp::set_sandboxes(&data.signaling, signals);
}

/// Wait until every sandbox has decremented the fan-in counter, up to
/// `timeout`. Safe for the realtime thread: bounded spin, then bounded
/// sleeps.
pub fn wait_for_all_sandboxes_done(
    data: &GroupShmData,
    signals: &GroupSignals,
    timeout: Duration,
) -> WaitDoneResult {
    let done = || data.sandboxes_processing.load(Ordering::Acquire) == 0;
    if done() {
        return WaitDoneResult::Done;
    }
    let deadline = Instant::now() + timeout;
    let start = Instant::now();
    // Short spin for the common case of fast sandboxes.
    while Instant::now() - start < SPIN_BUDGET {
        if done() {
            return WaitDoneResult::Done;
        }
        std::hint::spin_loop();
    }
    // Then lean on the done event in short slices.
    while Instant::now() < deadline {
        imp::wait_client(&data.signaling, signals, Duration::from_millis(1));
        if done() {
            return WaitDoneResult::Done;
        }
    }
    if done() {
        WaitDoneResult::Done
    } else {
        tracing::warn!("group did not finish a buffer within {timeout:?}");
        WaitDoneResult::NotResponding
    }
}

/// Sandbox side: block until the client publishes an epoch newer than
/// `local_epoch`, a stop is requested, or `timeout` passes without either.
///
/// A wake without epoch progress means some peer signaled itself while
/// shutting down; we just go back to waiting.
pub fn wait_for_signaled(
    data: &GroupShmData,
    signals: &GroupSignals,
    stop: &AtomicBool,
    local_epoch: &mut u64,
    timeout: Duration,
) -> WaitSignaledResult {
    let deadline = Instant::now() + timeout;
    loop {
        if stop.load(Ordering::Acquire) {
            return WaitSignaledResult::StopRequested;
        }
        let epoch = data.epoch.load(Ordering::Acquire);
        if epoch > *local_epoch {
            *local_epoch = epoch;
            return WaitSignaledResult::Signaled;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitSignaledResult::Timeout;
        }
        imp::wait_sandboxes(&data.signaling, signals, (deadline - now).min(Duration::from_millis(50)));
    }
}

/// Sandbox side: mark this sandbox's buffer complete. The last one to
/// finish fires the done event.
pub fn notify_sandbox_finished_processing(data: &GroupShmData, signals: &GroupSignals) {
    let prev = data.sandboxes_processing.fetch_sub(1, Ordering::Release);
    if prev == 1 {
        imp::set_client(&data.signaling, signals);
    }
}

/// Unblock a client stuck in [`wait_for_all_sandboxes_done`].
pub fn client_signal_self(data: &GroupShmData, signals: &GroupSignals) {
    imp::set_client(&data.signaling, signals);
}

/// Unblock sandbox workers stuck in [`wait_for_signaled`] (this wakes every
/// sandbox in the group; the others will see no epoch progress and re-wait).
pub fn sandbox_signal_self(data: &GroupShmData, signals: &GroupSignals) {
    imp::set_sandboxes(&data.signaling, signals);
}

/// Spin-then-sleep helper exposed for protocol code that polls shared
/// counters directly.
pub fn bounded_wait(timeout: Duration, done: impl FnMut() -> bool) -> bool {
    spin_then_sleep_until(Instant::now() + timeout, done)
}
