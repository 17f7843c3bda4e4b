//! Non-model shared state: the per-entity services holding segments,
//! transports, child process handles, and pending continuations.
//!
//! Services are reference-counted and shared by every model snapshot that
//! mentions their entity, so a logically-erased entity's segments survive
//! until the audio thread's last snapshot referencing it is collected.

use crate::report::GroupReport;
use parking_lot::Mutex;
use soundproof_core::ids::{DeviceId, ParamIdx};
use soundproof_core::params::ParamInfo;
use soundproof_ipc::IpcError;
use soundproof_ipc::layout::{
    AudioPortsShm, DEVICE_FLAG_HAS_GUI, DEVICE_FLAG_HAS_PARAMS, DeviceShm, GroupShm, ParamInfoShm,
    SandboxShm,
};
use soundproof_ipc::msg::{ClientMsg, SandboxMsg};
use soundproof_ipc::signal::{GroupSignals, SignalSide};
use soundproof_ipc::slot::SlotBuffer;
use soundproof_ipc::wire::{Receiver, Sender, WireError};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Continuations for the four async reply shapes. A token's type is
/// implicit in which reply-message variant carries it.
pub type ReturnDevice = Box<dyn FnOnce(DeviceId, bool) + Send>;
pub type ReturnDouble = Box<dyn FnOnce(f64) + Send>;
pub type ReturnString = Box<dyn FnOnce(String) + Send>;
pub type ReturnBytes = Box<dyn FnOnce(Vec<u8>) + Send>;

pub struct ReturnBuffers {
    pub devices: SlotBuffer<ReturnDevice>,
    pub doubles: SlotBuffer<ReturnDouble>,
    pub strings: SlotBuffer<ReturnString>,
    pub bytes: SlotBuffer<ReturnBytes>,
}

impl ReturnBuffers {
    fn new() -> Self {
        Self {
            devices: SlotBuffer::growable(),
            doubles: SlotBuffer::growable(),
            strings: SlotBuffer::growable(),
            bytes: SlotBuffer::growable(),
        }
    }
}

/// Client-side handle to one sandbox: its segment, transport state, child
/// process, and in-flight continuations.
pub struct SandboxService {
    shm: SandboxShm,
    pub child: Mutex<Option<Child>>,
    sender: Sender<ClientMsg>,
    receiver: Receiver<SandboxMsg>,
    pub returns: ReturnBuffers,
    /// Set once the poll thread has emitted `sbox_crashed` for this child.
    pub crash_reported: AtomicBool,
}

impl SandboxService {
    pub fn create(shmid: &str) -> Result<Self, IpcError> {
        Ok(Self {
            shm: SandboxShm::create(shmid)?,
            child: Mutex::new(None),
            sender: Sender::new(),
            receiver: Receiver::new(),
            returns: ReturnBuffers::new(),
            crash_reported: AtomicBool::new(false),
        })
    }

    pub fn shmid(&self) -> &str {
        self.shm.id()
    }

    pub fn enqueue(&self, msg: ClientMsg) {
        self.sender.enqueue(msg);
    }

    pub fn send_msgs(&self) {
        let data = self.shm.data();
        self.sender.send(|bytes| data.msgs_in.write(bytes));
    }

    pub fn receive_msgs(&self) -> Result<Vec<SandboxMsg>, WireError> {
        let data = self.shm.data();
        self.receiver.receive(|buf| data.msgs_out.read(buf))
    }

    pub fn is_running(&self) -> bool {
        self.child.lock().as_mut().is_some_and(|child| child.try_wait().ok().flatten().is_none())
    }

    /// Kill the child (if any) and reap it.
    pub fn terminate(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Reset transport state before restarting the child with the same
    /// segment: stale partial frames from the previous incarnation would
    /// desync the stream.
    pub fn reset_transport(&self) {
        let data = self.shm.data();
        data.msgs_in.init();
        data.msgs_out.init();
        self.sender.reset();
        self.receiver.reset();
    }
}

impl Drop for SandboxService {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Client-side handle to one group: segment, signaling, epoch, and the
/// per-group reporter queue.
pub struct GroupService {
    pub shm: GroupShm,
    pub signals: GroupSignals,
    /// Client-local epoch mirror; the authoritative copy lives in the
    /// segment.
    pub epoch: AtomicU64,
    /// Buffers degraded to silence because the group didn't finish in time.
    /// Consumed (and reported) by the poll thread.
    pub timeouts: AtomicU32,
    reports_tx: crossbeam_channel::Sender<GroupReport>,
    reports_rx: crossbeam_channel::Receiver<GroupReport>,
}

impl GroupService {
    pub fn create(shmid: &str) -> Result<Self, IpcError> {
        let shm = GroupShm::create(shmid)?;
        let signals = GroupSignals::init(SignalSide::Client, shmid)?;
        let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            shm,
            signals,
            epoch: AtomicU64::new(0),
            timeouts: AtomicU32::new(0),
            reports_tx,
            reports_rx,
        })
    }

    pub fn report(&self, report: GroupReport) {
        let _ = self.reports_tx.send(report);
    }

    pub fn drain_reports(&self, mut f: impl FnMut(GroupReport)) {
        while let Ok(report) = self.reports_rx.try_recv() {
            f(report);
        }
    }

    /// Timeout count since last asked, resetting the counter.
    pub fn take_timeouts(&self) -> u32 {
        self.timeouts.swap(0, Ordering::Relaxed)
    }
}

/// Client-side handle to one device's segments. The client carries the
/// *remove on close* flag: it unlinks the OS names when the last snapshot
/// holding this service is collected.
pub struct ClientDeviceService {
    pub shm: DeviceShm,
    pub ports: AudioPortsShm,
    params: Mutex<ParamInfoShm>,
}

impl ClientDeviceService {
    pub fn open(dev_shmid: &str, ports_shmid: &str, params_shmid: &str) -> Result<Self, IpcError> {
        Ok(Self {
            shm: DeviceShm::open(dev_shmid, true)?,
            ports: AudioPortsShm::open(ports_shmid, true)?,
            params: Mutex::new(ParamInfoShm::open(params_shmid, true)?),
        })
    }

    /// Swap in a rescanned parameter table. The previous segment unlinks
    /// when dropped here, after no reader references it.
    pub fn replace_params(&self, params_shmid: &str) -> Result<(), IpcError> {
        let fresh = ParamInfoShm::open(params_shmid, true)?;
        *self.params.lock() = fresh;
        Ok(())
    }

    pub fn has_gui(&self) -> bool {
        self.shm.data().flags.load(Ordering::Acquire) & DEVICE_FLAG_HAS_GUI != 0
    }

    pub fn has_params(&self) -> bool {
        self.shm.data().flags.load(Ordering::Acquire) & DEVICE_FLAG_HAS_PARAMS != 0
    }

    pub fn param_count(&self) -> usize {
        self.params.lock().data().count()
    }

    pub fn find_param(&self, param_id: u32) -> ParamIdx {
        self.params.lock().data().find(param_id).map_or(ParamIdx::INVALID, ParamIdx)
    }

    pub fn param_info(&self, index: ParamIdx) -> Option<ParamInfo> {
        self.params.lock().data().get(index.0)
    }
}
