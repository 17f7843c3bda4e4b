//! Typed shared-memory segment layouts and their naming scheme.
//!
//! All layouts are `#[repr(C)]` and valid when zeroed, which is exactly the
//! state a freshly `ftruncate`d mapping is in. Creators still run an
//! explicit `init` for clarity.
//!
//! Segment ids:
//! - group:   `<instance>+group+<id>`
//! - sandbox: `<instance>+sbox+<id>`
//! - device:  `<instance>+sbox+<sbox>+dev+<dev>+<uid>` (+`+ports`, `+params`)
//!
//! `<instance>` embeds the client pid so concurrent runs cannot collide.

use crate::IpcError;
use crate::ring::MsgRing;
use crate::shm::SharedMemory;
use crate::signal::SignalWords;
use soundproof_core::events::EventList;
use soundproof_core::ids::{DeviceId, GroupId, SandboxId};
use soundproof_core::params::ParamInfo;
use soundproof_core::{MAX_AUDIO_PORTS, MAX_PARAMS, SAMPLES_PER_PORT};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Instance id for the current client process.
pub fn make_instance_id() -> String {
    format!("sp+{}", std::process::id())
}

/// Buffer side selector for the double-buffered audio/event storage.
pub type Side = usize;

/// Device capability bit: plugin has an editor.
pub const DEVICE_FLAG_HAS_GUI: u32 = 1 << 0;
/// Device capability bit: plugin has parameters.
pub const DEVICE_FLAG_HAS_PARAMS: u32 = 1 << 1;

/// Device runtime bit: adapter is activated.
pub const DEVICE_ATOMIC_FLAG_ACTIVE: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Contents of a group segment.
#[repr(C)]
#[derive(Default)]
pub struct GroupShmData {
    /// Strictly monotonic processing epoch, stored with release ordering
    /// once per buffer.
    pub epoch: AtomicU64,
    /// Fan-in counter: sandboxes still working on the current buffer.
    pub sandboxes_processing: AtomicU32,
    /// Platform signaling words (see `signal`).
    pub signaling: SignalWords,
}

pub struct GroupShm {
    mem: SharedMemory,
}

impl GroupShm {
    pub fn make_id(instance_id: &str, group: GroupId) -> String {
        format!("{instance_id}+group+{group}")
    }

    pub fn create(shmid: &str) -> Result<Self, IpcError> {
        let mem = SharedMemory::create(shmid, std::mem::size_of::<GroupShmData>(), true)?;
        let this = Self { mem };
        let data = this.data();
        data.epoch.store(0, Ordering::Release);
        data.sandboxes_processing.store(0, Ordering::Release);
        Ok(this)
    }

    pub fn open(shmid: &str) -> Result<Self, IpcError> {
        let mem = SharedMemory::open(shmid, std::mem::size_of::<GroupShmData>(), false)?;
        Ok(Self { mem })
    }

    pub fn data(&self) -> &GroupShmData {
        // Layout is fixed by construction of this wrapper.
        unsafe { self.mem.as_ref() }
    }

    pub fn id(&self) -> &str {
        self.mem.name()
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Contents of a sandbox segment: one byte ring per direction.
#[repr(C)]
pub struct SandboxShmData {
    /// Client -> sandbox.
    pub msgs_in: MsgRing,
    /// Sandbox -> client.
    pub msgs_out: MsgRing,
}

pub struct SandboxShm {
    mem: SharedMemory,
}

impl SandboxShm {
    pub fn make_id(instance_id: &str, sbox: SandboxId) -> String {
        format!("{instance_id}+sbox+{sbox}")
    }

    pub fn create(shmid: &str) -> Result<Self, IpcError> {
        let mem = SharedMemory::create(shmid, std::mem::size_of::<SandboxShmData>(), true)?;
        let this = Self { mem };
        this.data().msgs_in.init();
        this.data().msgs_out.init();
        Ok(this)
    }

    pub fn open(shmid: &str) -> Result<Self, IpcError> {
        let mem = SharedMemory::open(shmid, std::mem::size_of::<SandboxShmData>(), false)?;
        Ok(Self { mem })
    }

    pub fn data(&self) -> &SandboxShmData {
        unsafe { self.mem.as_ref() }
    }

    pub fn id(&self) -> &str {
        self.mem.name()
    }
}

// ---------------------------------------------------------------------------
// Device: control/event block
// ---------------------------------------------------------------------------

/// Double-buffered event storage. Writers clear-and-fill one side per
/// buffer; readers only read. The epoch protocol keeps both sides from
/// being touched in the same step.
#[repr(C)]
pub struct SharedEventList(UnsafeCell<EventList>);

unsafe impl Sync for SharedEventList {}

impl SharedEventList {
    /// # Safety
    ///
    /// Caller must hold the side discipline: at any instant each side has a
    /// single accessor.
    pub unsafe fn borrow_mut(&self) -> &mut EventList {
        unsafe { &mut *self.0.get() }
    }

    pub fn init(&self) {
        unsafe {
            *self.0.get() = EventList::new();
        }
    }
}

/// Contents of a device's control segment.
#[repr(C)]
pub struct DeviceShmData {
    /// `DEVICE_FLAG_*` capability bits, written once at creation.
    pub flags: AtomicU32,
    /// `DEVICE_ATOMIC_FLAG_*` runtime bits.
    pub atomic_flags: AtomicU32,
    pub events_in: [SharedEventList; 2],
    pub events_out: [SharedEventList; 2],
}

pub struct DeviceShm {
    mem: SharedMemory,
}

impl DeviceShm {
    pub fn make_id(instance_id: &str, sbox: SandboxId, dev: DeviceId, uid: u64) -> String {
        format!("{instance_id}+sbox+{sbox}+dev+{dev}+{uid}")
    }

    pub fn create(shmid: &str) -> Result<Self, IpcError> {
        let mem = SharedMemory::create(shmid, std::mem::size_of::<DeviceShmData>(), false)?;
        let this = Self { mem };
        let data = this.data();
        data.flags.store(0, Ordering::Release);
        data.atomic_flags.store(0, Ordering::Release);
        for list in data.events_in.iter().chain(data.events_out.iter()) {
            list.init();
        }
        Ok(this)
    }

    /// Open from the client side; the client removes the OS name when it is
    /// done with the device.
    pub fn open(shmid: &str, remove_on_drop: bool) -> Result<Self, IpcError> {
        let mem =
            SharedMemory::open(shmid, std::mem::size_of::<DeviceShmData>(), remove_on_drop)?;
        Ok(Self { mem })
    }

    pub fn data(&self) -> &DeviceShmData {
        unsafe { self.mem.as_ref() }
    }

    pub fn id(&self) -> &str {
        self.mem.name()
    }
}

// ---------------------------------------------------------------------------
// Device: audio port buffers
// ---------------------------------------------------------------------------

/// One side of one port: `CHANNEL_COUNT * VECTOR_SIZE` floats,
/// channel-major.
pub type AudioBlock = [f32; SAMPLES_PER_PORT];

/// Contents of a device's audio-port segment. Fixed worst-case footprint;
/// port counts above [`MAX_AUDIO_PORTS`] are refused at creation.
#[repr(C)]
pub struct AudioPortsShmData {
    input_count: AtomicU32,
    output_count: AtomicU32,
    inputs: [[UnsafeCell<AudioBlock>; 2]; MAX_AUDIO_PORTS],
    outputs: [[UnsafeCell<AudioBlock>; 2]; MAX_AUDIO_PORTS],
}

unsafe impl Sync for AudioPortsShmData {}

impl AudioPortsShmData {
    pub fn input_count(&self) -> usize {
        self.input_count.load(Ordering::Acquire) as usize
    }

    pub fn output_count(&self) -> usize {
        self.output_count.load(Ordering::Acquire) as usize
    }

    /// # Safety
    ///
    /// Side discipline as with [`SharedEventList::borrow_mut`].
    pub unsafe fn input(&self, port: usize, side: Side) -> &mut AudioBlock {
        unsafe { &mut *self.inputs[port][side & 1].get() }
    }

    /// # Safety
    ///
    /// Side discipline as with [`SharedEventList::borrow_mut`].
    pub unsafe fn output(&self, port: usize, side: Side) -> &mut AudioBlock {
        unsafe { &mut *self.outputs[port][side & 1].get() }
    }
}

pub struct AudioPortsShm {
    mem: SharedMemory,
}

impl AudioPortsShm {
    pub fn make_id(instance_id: &str, sbox: SandboxId, dev: DeviceId, uid: u64) -> String {
        format!("{}+ports", DeviceShm::make_id(instance_id, sbox, dev, uid))
    }

    pub fn create(shmid: &str, input_ports: usize, output_ports: usize) -> Result<Self, IpcError> {
        if input_ports > MAX_AUDIO_PORTS || output_ports > MAX_AUDIO_PORTS {
            return Err(IpcError::Capacity(format!(
                "audio port count {input_ports}/{output_ports} exceeds {MAX_AUDIO_PORTS}"
            )));
        }
        let mem = SharedMemory::create(shmid, std::mem::size_of::<AudioPortsShmData>(), false)?;
        let this = Self { mem };
        let data = this.data();
        data.input_count.store(input_ports as u32, Ordering::Release);
        data.output_count.store(output_ports as u32, Ordering::Release);
        Ok(this)
    }

    pub fn open(shmid: &str, remove_on_drop: bool) -> Result<Self, IpcError> {
        let mem =
            SharedMemory::open(shmid, std::mem::size_of::<AudioPortsShmData>(), remove_on_drop)?;
        Ok(Self { mem })
    }

    pub fn data(&self) -> &AudioPortsShmData {
        unsafe { self.mem.as_ref() }
    }

    pub fn id(&self) -> &str {
        self.mem.name()
    }
}

// ---------------------------------------------------------------------------
// Device: parameter metadata table
// ---------------------------------------------------------------------------

/// Contents of a device's param-info segment. Written once before the
/// segment id is announced, read-only afterwards; a parameter rescan
/// allocates a whole new segment instead of mutating this one.
#[repr(C)]
pub struct ParamInfoShmData {
    count: AtomicU32,
    entries: [UnsafeCell<ParamInfo>; MAX_PARAMS],
}

unsafe impl Sync for ParamInfoShmData {}

impl ParamInfoShmData {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub fn get(&self, index: usize) -> Option<ParamInfo> {
        if index >= self.count() {
            return None;
        }
        // Entries are immutable once count is published.
        Some(unsafe { *self.entries[index].get() })
    }

    /// Find the table index of a plugin-native parameter id.
    pub fn find(&self, param_id: u32) -> Option<usize> {
        (0..self.count()).find(|&i| self.get(i).is_some_and(|info| info.id == param_id))
    }
}

pub struct ParamInfoShm {
    mem: SharedMemory,
}

impl ParamInfoShm {
    pub fn make_id(instance_id: &str, sbox: SandboxId, dev: DeviceId, uid: u64) -> String {
        format!("{}+params", DeviceShm::make_id(instance_id, sbox, dev, uid))
    }

    pub fn create(shmid: &str, params: &[ParamInfo]) -> Result<Self, IpcError> {
        if params.len() > MAX_PARAMS {
            return Err(IpcError::Capacity(format!(
                "parameter count {} exceeds {MAX_PARAMS}",
                params.len()
            )));
        }
        let mem = SharedMemory::create(shmid, std::mem::size_of::<ParamInfoShmData>(), false)?;
        let this = Self { mem };
        let data = this.data();
        for (slot, info) in data.entries.iter().zip(params) {
            unsafe {
                *slot.get() = *info;
            }
        }
        // Publish the count last; readers acquire it.
        data.count.store(params.len() as u32, Ordering::Release);
        Ok(this)
    }

    pub fn open(shmid: &str, remove_on_drop: bool) -> Result<Self, IpcError> {
        let mem =
            SharedMemory::open(shmid, std::mem::size_of::<ParamInfoShmData>(), remove_on_drop)?;
        Ok(Self { mem })
    }

    pub fn data(&self) -> &ParamInfoShmData {
        unsafe { self.mem.as_ref() }
    }

    pub fn id(&self) -> &str {
        self.mem.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundproof_core::events::Event;

    fn unique(tag: &str) -> String {
        format!("sp-test-layout-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_segment_id_scheme() {
        assert_eq!(GroupShm::make_id("sp+100", GroupId(3)), "sp+100+group+3");
        assert_eq!(SandboxShm::make_id("sp+100", SandboxId(4)), "sp+100+sbox+4");
        assert_eq!(
            DeviceShm::make_id("sp+100", SandboxId(4), DeviceId(9), 2),
            "sp+100+sbox+4+dev+9+2"
        );
        assert!(AudioPortsShm::make_id("sp+100", SandboxId(4), DeviceId(9), 2).ends_with("+ports"));
        assert!(ParamInfoShm::make_id("sp+100", SandboxId(4), DeviceId(9), 2).ends_with("+params"));
    }

    #[test]
    fn test_group_segment_round_trip() {
        let id = unique("group");
        let creator = GroupShm::create(&id).unwrap();
        creator.data().epoch.store(41, Ordering::Release);
        let opener = GroupShm::open(&id).unwrap();
        assert_eq!(opener.data().epoch.load(Ordering::Acquire), 41);
    }

    #[test]
    fn test_sandbox_rings_cross_mapping() {
        let id = unique("sbox");
        let creator = SandboxShm::create(&id).unwrap();
        let opener = SandboxShm::open(&id).unwrap();
        assert_eq!(creator.data().msgs_in.write(b"ping"), 4);
        let mut buf = [0u8; 8];
        let n = opener.data().msgs_in.read(&mut buf);
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_device_event_sides_are_independent() {
        let id = unique("dev");
        let dev = DeviceShm::create(&id).unwrap();
        let data = dev.data();
        unsafe {
            data.events_in[0].borrow_mut().push(Event::NoteChoke { time: 1, channel: 0, key: 0 });
        }
        unsafe {
            assert_eq!(data.events_in[0].borrow_mut().len(), 1);
            assert!(data.events_in[1].borrow_mut().is_empty());
        }
    }

    #[test]
    fn test_port_count_overflow_is_refused() {
        let id = unique("ports-over");
        assert!(AudioPortsShm::create(&id, MAX_AUDIO_PORTS + 1, 1).is_err());
        // The refused create must not leave a mapping behind.
        assert!(AudioPortsShm::open(&id, false).is_err());
    }

    #[test]
    fn test_param_table_publish_and_find() {
        let id = unique("params");
        let infos =
            vec![ParamInfo::new(10, "A", 0.0, 1.0, 0.0), ParamInfo::new(20, "B", 0.0, 1.0, 1.0)];
        let seg = ParamInfoShm::create(&id, &infos).unwrap();
        assert_eq!(seg.data().count(), 2);
        assert_eq!(seg.data().find(20), Some(1));
        assert_eq!(seg.data().find(99), None);
        assert_eq!(seg.data().get(0).unwrap().name(), "A");
    }

    #[test]
    fn test_param_count_overflow_is_refused() {
        let id = unique("params-over");
        let infos = vec![ParamInfo::default(); MAX_PARAMS + 1];
        assert!(ParamInfoShm::create(&id, &infos).is_err());
    }
}
