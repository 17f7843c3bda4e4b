//! Sandbox process state.

use crate::graph;
use parking_lot::Mutex;
use soundproof_clap::ClapAdapter;
use soundproof_comms::rtrb;
use soundproof_comms::{AudioSnapshots, AudioSync};
use soundproof_core::PluginFormat;
use soundproof_core::events::Event;
use soundproof_core::ids::DeviceId;
use soundproof_ipc::IpcError;
use soundproof_ipc::layout::{AudioPortsShm, DeviceShm, GroupShm, ParamInfoShm, SandboxShm};
use soundproof_ipc::msg::{ClientMsg, SandboxMsg};
use soundproof_ipc::signal::{GroupSignals, SignalSide};
use soundproof_ipc::wire::{Receiver, Sender};
use soundproof_plugin::PluginAdapter;
use soundproof_plugin::builtin::{BUILTIN_GAIN_ID, GainAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

/// Capacity of the main-thread -> audio-thread event queue per device.
const MAIN_EVENT_QUEUE_CAPACITY: usize = 256;

/// An intra-sandbox audio edge out of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalConn {
    pub this_port: usize,
    pub peer_dev: DeviceId,
    pub peer_port: usize,
}

/// A cross-sandbox audio edge into a local device. The reader side copies
/// from the writer's mapped output buffers.
#[derive(Clone)]
pub struct RemoteInputConn {
    pub this_port: usize,
    pub remote_dev: DeviceId,
    pub remote_port: usize,
    pub remote_ports: Arc<AudioPortsShm>,
}

/// Non-model, shared per-device resources.
pub struct DeviceService {
    pub shm: DeviceShm,
    pub ports: AudioPortsShm,
    /// Current param-info segment. Replaced wholesale on rescan.
    pub params: Mutex<ParamInfoShm>,
    pub adapter: Mutex<Box<dyn PluginAdapter>>,
    pub events_from_main_tx: Mutex<rtrb::Producer<Event>>,
    pub events_from_main_rx: Mutex<rtrb::Consumer<Event>>,
    /// Uid used in this device's segment names.
    pub uid: u64,
}

/// One hosted device as seen by the local model.
#[derive(Clone)]
pub struct SboxDevice {
    pub id: DeviceId,
    pub format: PluginFormat,
    pub conns: Vec<LocalConn>,
    pub input_conns: Vec<RemoteInputConn>,
    pub service: Arc<DeviceService>,
}

/// The sandbox's local device model, published to the audio worker.
#[derive(Clone, Default)]
pub struct SboxModel {
    pub devices: HashMap<DeviceId, SboxDevice>,
    /// Creation order; the topological sort's deterministic tie-break.
    pub insertion: Vec<DeviceId>,
    /// Processing order, recomputed on every topology change.
    pub order: Vec<DeviceId>,
}

impl SboxModel {
    pub fn recompute_order(&mut self) {
        let edges: Vec<(DeviceId, DeviceId)> = self
            .devices
            .values()
            .flat_map(|dev| dev.conns.iter().map(|conn| (dev.id, conn.peer_dev)))
            .collect();
        self.order = graph::processing_order(&self.insertion, &edges);
    }
}

pub struct App {
    pub group: GroupShm,
    pub signals: GroupSignals,
    pub sbox: SandboxShm,
    pub sbox_shmid: String,
    pub sender: Sender<SandboxMsg>,
    pub receiver: Receiver<ClientMsg>,
    pub model: AudioSync<SboxModel>,
    /// Handed to the audio worker on activate, returned on deactivate.
    pub snapshots: Mutex<Option<AudioSnapshots<SboxModel>>>,
    pub worker: Mutex<Option<JoinHandle<AudioSnapshots<SboxModel>>>>,
    pub sample_rate: Mutex<f64>,
    pub active: AtomicBool,
    /// Stop token for the audio worker.
    pub stop: AtomicBool,
    pub schedule_terminate: AtomicBool,
    pub last_heartbeat: Mutex<Instant>,
    uid_gen: AtomicU64,
}

impl App {
    pub fn new(group_shmid: &str, sbox_shmid: &str, sample_rate: f64) -> Result<Self, IpcError> {
        let group = GroupShm::open(group_shmid)?;
        let signals = GroupSignals::init(SignalSide::Sandbox, group_shmid)?;
        let sbox = SandboxShm::open(sbox_shmid)?;
        let (model, snapshots) = AudioSync::new(SboxModel::default());
        Ok(Self {
            group,
            signals,
            sbox,
            sbox_shmid: sbox_shmid.to_string(),
            sender: Sender::new(),
            receiver: Receiver::new(),
            model,
            snapshots: Mutex::new(Some(snapshots)),
            worker: Mutex::new(None),
            sample_rate: Mutex::new(sample_rate),
            active: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            schedule_terminate: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            uid_gen: AtomicU64::new(0),
        })
    }

    pub fn send(&self, msg: SandboxMsg) {
        self.sender.enqueue(msg);
    }

    /// Flush outgoing messages and collect incoming ones.
    pub fn poll_messages(&self) -> Result<Vec<ClientMsg>, IpcError> {
        let data = self.sbox.data();
        self.sender.send(|bytes| data.msgs_out.write(bytes));
        let msgs = self.receiver.receive(|buf| data.msgs_in.read(buf))?;
        Ok(msgs)
    }

    pub fn next_uid(&self) -> u64 {
        self.uid_gen.fetch_add(1, Ordering::Relaxed)
    }

    /// Segment id stems for a device hosted here.
    pub fn device_shmid(&self, dev: DeviceId, uid: u64) -> String {
        format!("{}+dev+{}+{}", self.sbox_shmid, dev, uid)
    }

    pub fn terminate(&self) {
        self.schedule_terminate.store(true, Ordering::Release);
    }

    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> std::time::Duration {
        self.last_heartbeat.lock().elapsed()
    }
}

/// Pick the adapter implementation for a device-create request.
pub fn instantiate_adapter(
    format: PluginFormat,
    plugfile_path: &str,
    plugin_ext_id: &str,
) -> Result<Box<dyn PluginAdapter>, String> {
    match format {
        PluginFormat::Clap => ClapAdapter::create(plugfile_path, plugin_ext_id)
            .map(|adapter| Box::new(adapter) as Box<dyn PluginAdapter>)
            .map_err(|e| e.to_string()),
        PluginFormat::Unknown if plugin_ext_id == BUILTIN_GAIN_ID => {
            Ok(Box::new(GainAdapter::new()))
        }
        PluginFormat::Vst3 => Err("vst3 hosting is not implemented".to_string()),
        PluginFormat::Unknown => Err(format!("unknown plugin id {plugin_ext_id:?}")),
    }
}

/// Build the per-device main-thread event queue.
pub fn main_event_queue() -> (rtrb::Producer<Event>, rtrb::Consumer<Event>) {
    rtrb::RingBuffer::new(MAIN_EVENT_QUEUE_CAPACITY)
}
