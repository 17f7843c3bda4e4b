//! The client instance: control plane, poll thread, and lifecycle.
//!
//! All public operations hang off [`Instance`], the explicit handle
//! returned by [`Instance::init`]. Async operations enqueue a message
//! carrying a slot-buffer token and return immediately; their continuations
//! run on the poll thread when the reply arrives.

use crate::audio::{GroupProcess, audio_process};
use crate::model::{Device, Group, Model, OutputConn, Plugfile, Plugin, Sandbox};
use crate::report::{GeneralReport, GroupReport};
use crate::scan::{ScanFlags, ScanState};
use crate::service::{
    ClientDeviceService, GroupService, ReturnBytes, ReturnDevice, ReturnDouble, ReturnString,
    SandboxService,
};
use parking_lot::Mutex;
use soundproof_comms::{AudioSnapshots, AudioSync};
use soundproof_core::events::Event;
use soundproof_core::ids::{DeviceId, GroupId, IdGen, ParamIdx, PluginId, SandboxId};
use soundproof_core::params::ParamInfo;
use soundproof_core::{
    Error, GC_INTERVAL_MS, HEARTBEAT_INTERVAL_MS, MAX_AUDIO_PORTS, POLL_SLEEP_MS, PluginFormat,
    RenderMode, Result,
};
use soundproof_ipc::layout::{GroupShm, SandboxShm, make_instance_id};
use soundproof_ipc::msg::{ClientMsg, SandboxMsg};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub(crate) struct Inner {
    pub instance_id: String,
    pub ids: IdGen,
    pub model: AudioSync<Model>,
    /// The audio thread's snapshot reader. Only `audio_process` locks it.
    pub snapshots: Mutex<AudioSnapshots<Model>>,
    pub general_tx: crossbeam_channel::Sender<GeneralReport>,
    pub general_rx: crossbeam_channel::Receiver<GeneralReport>,
    pub scan: Mutex<ScanState>,
    pub scanning: AtomicBool,
    stop: AtomicBool,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub fn report_general(&self, report: GeneralReport) {
        let _ = self.general_tx.send(report);
    }

    /// Queue a report on a group's reporter unless reporting is off.
    pub fn report_group(&self, m: &Model, group: GroupId, report: GroupReport) {
        if let Some(group) = m.groups.get(&group) {
            if !group.no_reporting {
                group.service.report(report);
            }
        }
    }

    pub fn report_for_sandbox(&self, m: &Model, sbox: SandboxId, report: GroupReport) {
        if let Some(sandbox) = m.sandboxes.get(&sbox) {
            self.report_group(m, sandbox.group, report);
        }
    }
}

/// Handle to one initialized soundproof client.
///
/// Cheap to clone; all clones drive the same instance. [`init`] and
/// [`shutdown`] bound its lifecycle -- call `shutdown` when done, nothing
/// stops implicitly on drop.
///
/// [`init`]: Instance::init
/// [`shutdown`]: Instance::shutdown
#[derive(Clone)]
pub struct Instance {
    inner: Arc<Inner>,
}

impl Instance {
    /// Initialize the sandboxing system: builds the empty model and starts
    /// the poll thread.
    pub fn init() -> Result<Self> {
        let (model, snapshots) = AudioSync::new(Model::default());
        let (general_tx, general_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            instance_id: make_instance_id(),
            ids: IdGen::new(),
            model,
            snapshots: Mutex::new(snapshots),
            general_tx,
            general_rx,
            scan: Mutex::new(ScanState::default()),
            scanning: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            poll: Mutex::new(None),
        });
        let poll = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("sp-client-poll".to_string())
                .spawn(move || poll_thread(&inner))
                .map_err(|e| Error::Sandbox(format!("failed to start poll thread: {e}")))?
        };
        *inner.poll.lock() = Some(poll);
        tracing::info!(instance = %inner.instance_id, "soundproof initialized");
        Ok(Self { inner })
    }

    /// Stop the poll thread, the scanner, and every sandbox child.
    pub fn shutdown(&self) {
        crate::scan::stop_scan(&self.inner);
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.poll.lock().take() {
            let _ = handle.join();
        }
        let services = self.inner.model.with(|m| {
            m.sandboxes.values().map(|s| Arc::clone(&s.service)).collect::<Vec<_>>()
        });
        for service in services {
            service.enqueue(ClientMsg::CleanShutdown);
            service.send_msgs();
            service.terminate();
        }
    }

    // -- realtime -----------------------------------------------------------

    /// Process one buffer for one group. Realtime-safe.
    pub fn audio_process(&self, process: &mut GroupProcess<'_>) {
        audio_process(&self.inner, process);
    }

    // -- reporters ----------------------------------------------------------

    /// Drain the general report queue into `f` on the calling thread.
    pub fn receive_reports(&self, mut f: impl FnMut(GeneralReport)) {
        while let Ok(report) = self.inner.general_rx.try_recv() {
            f(report);
        }
    }

    /// Drain one group's report queue into `f` on the calling thread.
    pub fn receive_group_reports(&self, group: GroupId, mut f: impl FnMut(GroupReport)) {
        let service = self.inner.model.with(|m| m.groups.get(&group).map(|g| Arc::clone(&g.service)));
        if let Some(service) = service {
            service.drain_reports(&mut f);
        }
    }

    // -- groups -------------------------------------------------------------

    pub fn create_group(&self, sample_rate: f64) -> Result<GroupId> {
        let id = GroupId(self.inner.ids.next());
        let shmid = GroupShm::make_id(&self.inner.instance_id, id);
        let service = Arc::new(GroupService::create(&shmid).map_err(|e| Error::Ipc(e.to_string()))?);
        self.inner.model.modify(|m| {
            m.groups.insert(
                id,
                Group {
                    id,
                    sample_rate,
                    render_mode: RenderMode::Realtime,
                    active: false,
                    no_reporting: false,
                    sandboxes: BTreeSet::new(),
                    service,
                },
            );
        });
        tracing::info!("created group {id} at {sample_rate} Hz");
        Ok(id)
    }

    /// Erase a group, terminating its sandboxes. Logical while the audio
    /// thread runs; backing resources go with the snapshots.
    pub fn erase_group(&self, group: GroupId) -> Result<()> {
        self.inner.model.modify(|m| {
            let sandboxes: Vec<SandboxId> = m.group(group)?.sandboxes.iter().copied().collect();
            for sbox in sandboxes {
                if let Ok(sandbox) = m.sandbox(sbox) {
                    sandbox.service.terminate();
                }
                m.erase_sandbox(sbox);
            }
            m.groups.remove(&group);
            Ok(())
        })
    }

    /// Start audio processing for the group.
    pub fn activate(&self, group: GroupId) -> Result<()> {
        self.inner.model.modify(|m| {
            let sr = m.group(group)?.sample_rate;
            let group_entry = m.groups.get_mut(&group).expect("checked above");
            group_entry.active = true;
            let sandboxes: Vec<SandboxId> = group_entry.sandboxes.iter().copied().collect();
            for sbox in sandboxes {
                if let Ok(sandbox) = m.sandbox(sbox) {
                    sandbox.service.enqueue(ClientMsg::Activate { sr });
                }
            }
            Ok(())
        })
    }

    pub fn deactivate(&self, group: GroupId) -> Result<()> {
        self.inner.model.modify(|m| {
            m.group(group)?;
            let group_entry = m.groups.get_mut(&group).expect("checked above");
            group_entry.active = false;
            let sandboxes: Vec<SandboxId> = group_entry.sandboxes.iter().copied().collect();
            for sbox in sandboxes {
                if let Ok(sandbox) = m.sandbox(sbox) {
                    sandbox.service.enqueue(ClientMsg::Deactivate);
                }
            }
            Ok(())
        })
    }

    /// Set the render mode for every device in the group.
    pub fn set_render_mode(&self, group: GroupId, mode: RenderMode) -> Result<()> {
        self.inner.model.modify(|m| {
            m.group(group)?;
            if let Some(entry) = m.groups.get_mut(&group) {
                entry.render_mode = mode;
            }
            let devices: Vec<(SandboxId, DeviceId)> = m
                .devices
                .values()
                .filter(|d| m.sandboxes.get(&d.sbox).is_some_and(|s| s.group == group))
                .map(|d| (d.sbox, d.id))
                .collect();
            for (sbox, dev) in devices {
                if let Ok(sandbox) = m.sandbox(sbox) {
                    sandbox.service.enqueue(ClientMsg::DeviceSetRenderMode { dev, mode });
                }
            }
            Ok(())
        })
    }

    /// Suppress or re-enable the group's reporter queue.
    pub fn set_reporting(&self, group: GroupId, enabled: bool) -> Result<()> {
        self.inner.model.modify(|m| {
            m.group(group)?;
            if let Some(entry) = m.groups.get_mut(&group) {
                entry.no_reporting = !enabled;
            }
            Ok(())
        })
    }

    // -- sandboxes ----------------------------------------------------------

    /// Create a sandbox in `group` by spawning `sbox_exe`. The sandbox id
    /// is returned even if the child fails to start; the failure lands in
    /// the sandbox's error string and a reporter message.
    pub fn create_sandbox(&self, group: GroupId, sbox_exe: &Path) -> Result<SandboxId> {
        let id = SandboxId(self.inner.ids.next());
        let shmid = SandboxShm::make_id(&self.inner.instance_id, id);
        let service =
            Arc::new(SandboxService::create(&shmid).map_err(|e| Error::Ipc(e.to_string()))?);
        self.inner.model.modify(|m| {
            let group_entry = m.group(group)?;
            let group_shmid = group_entry.service.shm.id().to_string();
            let sample_rate = group_entry.sample_rate;
            let active = group_entry.active;
            let mut error = String::new();
            match spawn_sandbox(sbox_exe, &group_shmid, service.shmid(), sample_rate, &self.inner.instance_id)
            {
                Ok(child) => {
                    *service.child.lock() = Some(child);
                }
                Err(err) => {
                    error = err.to_string();
                }
            }
            let ok = error.is_empty();
            m.sandboxes.insert(
                id,
                Sandbox {
                    id,
                    group,
                    error: error.clone(),
                    devices: BTreeSet::new(),
                    service: Arc::clone(&service),
                },
            );
            m.add_sandbox_to_group(group, id);
            if ok {
                if active {
                    service.enqueue(ClientMsg::Activate { sr: sample_rate });
                }
                self.inner.report_group(m, group, GroupReport::SboxStarted { sbox: id });
            } else {
                self.inner.report_group(m, group, GroupReport::SboxError { sbox: id, error });
            }
            Ok::<(), soundproof_core::Error>(())
        })?;
        tracing::info!("created sandbox {id} in group {group}");
        Ok(id)
    }

    /// Erase a sandbox, terminating its child and dropping its devices.
    pub fn erase_sandbox(&self, sbox: SandboxId) -> Result<()> {
        self.inner.model.modify(|m| {
            let sandbox = m.sandbox(sbox)?;
            sandbox.service.terminate();
            m.erase_sandbox(sbox);
            Ok(())
        })
    }

    /// Restart a crashed or wedged sandbox under the same id, re-creating
    /// its devices and re-sending its connections.
    pub fn restart(&self, sbox: SandboxId, sbox_exe: &Path) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        // Kill and reset outside the model lock; the drained continuations
        // may call back into the instance.
        let service = self.inner.model.with(|m| Ok::<_, Error>(Arc::clone(&m.sandbox(sbox)?.service)))?;
        service.terminate();
        service.reset_transport();
        for cb in service.returns.devices.drain() {
            cb(DeviceId::INVALID, false);
        }
        service.returns.doubles.drain();
        service.returns.strings.drain();
        service.returns.bytes.drain();
        service.crash_reported.store(false, Ordering::Release);

        let mut failed_creates: Vec<(DeviceId, ReturnDevice)> = Vec::new();
        let result = self.inner.model.modify(|m| {
            let sandbox = m.sandbox(sbox)?;
            let group = sandbox.group;
            let group_entry = m.group(group)?;
            let group_shmid = group_entry.service.shm.id().to_string();
            let sample_rate = group_entry.sample_rate;
            let active = group_entry.active;

            let child = spawn_sandbox(sbox_exe, &group_shmid, service.shmid(), sample_rate, &inner.instance_id)
                .map_err(|e| Error::Sandbox(format!("restart of {sbox} failed: {e}")))?;
            *service.child.lock() = Some(child);
            if let Some(entry) = m.sandboxes.get_mut(&sbox) {
                entry.error.clear();
            }
            if active {
                service.enqueue(ClientMsg::Activate { sr: sample_rate });
            }

            // Re-create every device this sandbox hosted; their remote
            // halves died with the old process.
            let devices: Vec<DeviceId> = m.sandbox(sbox)?.devices.iter().copied().collect();
            for dev in devices {
                if let Some(device) = m.devices.get_mut(&dev) {
                    device.service = None;
                    "sandbox restarted".clone_into(&mut device.error);
                }
                let cb = late_create_callback(&inner, sbox);
                if let Err(cb) = enqueue_device_create(m, dev, cb) {
                    failed_creates.push((dev, cb));
                }
            }
            // And replay the connection list involving its devices.
            let conns: Vec<(DeviceId, OutputConn)> = m
                .devices
                .values()
                .filter(|d| {
                    d.sbox == sbox
                        || m.devices
                            .values()
                            .any(|peer| peer.sbox == sbox && d.conns.iter().any(|c| c.peer_dev == peer.id))
                })
                .flat_map(|d| d.conns.iter().map(move |c| (d.id, *c)))
                .collect();
            for (out_dev, conn) in conns {
                send_connect_messages(m, out_dev, conn.this_port, conn.peer_dev, conn.peer_port);
            }
            inner.report_group(m, group, GroupReport::SboxStarted { sbox });
            Ok(())
        });
        for (dev, cb) in failed_creates {
            cb(dev, false);
        }
        result
    }

    pub fn is_running(&self, sbox: SandboxId) -> bool {
        self.inner.model.with(|m| {
            m.sandboxes.get(&sbox).is_some_and(|s| s.service.is_running())
        })
    }

    pub fn sandbox_error(&self, sbox: SandboxId) -> Result<String> {
        self.inner.model.with(|m| Ok(m.sandbox(sbox)?.error.clone()))
    }

    // -- devices ------------------------------------------------------------

    /// Create a device asynchronously. The returned id is valid
    /// immediately; if the plugin is unknown the device sits in a sticky
    /// error state until a scan with the reload flag finds it.
    pub fn create_device(
        &self,
        sbox: SandboxId,
        format: PluginFormat,
        plugin_ext_id: &str,
        cb: ReturnDevice,
    ) -> Result<DeviceId> {
        let id = DeviceId(self.inner.ids.next());
        create_device_with_id(&self.inner, id, sbox, format, plugin_ext_id, cb)?;
        Ok(id)
    }

    /// Duplicate a device into `dst_sbox`: save the source state, create a
    /// fresh device of the same plugin, then load the state into it.
    pub fn duplicate(
        &self,
        src_dev: DeviceId,
        dst_sbox: SandboxId,
        cb: ReturnDevice,
    ) -> Result<DeviceId> {
        let (format, ext_id) = self.inner.model.with(|m| {
            let device = m.device(src_dev)?;
            Ok::<_, Error>((device.format, device.plugin_ext_id.clone()))
        })?;
        let new_dev = DeviceId(self.inner.ids.next());
        let weak = Arc::downgrade(&self.inner);
        self.save_async(
            src_dev,
            Box::new(move |state: Vec<u8>| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let weak = Weak::clone(&weak);
                // Once the new device exists, load the saved state into it.
                let continuation: ReturnDevice = Box::new(move |dev, success| {
                    if success {
                        if let Some(inner) = weak.upgrade() {
                            let _ = instance_from(&inner).load_async(dev, state, Box::new(|_, _| {}));
                        }
                    }
                    cb(dev, success);
                });
                let _ = create_device_with_id(&inner, new_dev, dst_sbox, format, &ext_id, continuation);
            }),
        )?;
        Ok(new_dev)
    }

    /// Erase a device. Safe while the audio thread is processing; the
    /// backing segments die with the last snapshot referencing them.
    pub fn erase_device(&self, dev: DeviceId) -> Result<()> {
        self.inner.model.modify(|m| {
            let device = m.device(dev)?;
            let group = m.sandbox(device.sbox)?.group;
            // Every sandbox in the group may hold cross-sandbox state for
            // this device.
            let sandboxes: Vec<SandboxId> = m.group(group)?.sandboxes.iter().copied().collect();
            for sbox in sandboxes {
                if let Ok(sandbox) = m.sandbox(sbox) {
                    sandbox.service.enqueue(ClientMsg::DeviceErase { dev });
                }
            }
            m.erase_device(dev);
            Ok(())
        })
    }

    pub fn device_error(&self, dev: DeviceId) -> Result<String> {
        self.inner.model.with(|m| Ok(m.device(dev)?.error.clone()))
    }

    pub fn was_loaded_successfully(&self, dev: DeviceId) -> bool {
        self.inner.model.with(|m| m.devices.get(&dev).is_some_and(Device::was_loaded_successfully))
    }

    pub fn device_name(&self, dev: DeviceId) -> Result<String> {
        self.inner.model.with(|m| Ok(m.device(dev)?.name.clone()))
    }

    pub fn set_device_name(&self, dev: DeviceId, name: &str) -> Result<()> {
        self.inner.model.modify(|m| {
            m.device(dev)?;
            if let Some(device) = m.devices.get_mut(&dev) {
                name.clone_into(&mut device.name);
            }
            Ok(())
        })
    }

    pub fn device_plugin(&self, dev: DeviceId) -> Result<PluginId> {
        self.inner.model.with(|m| Ok(m.device(dev)?.plugin))
    }

    pub fn has_gui(&self, dev: DeviceId) -> bool {
        self.device_service(dev).is_some_and(|s| s.has_gui())
    }

    pub fn has_params(&self, dev: DeviceId) -> bool {
        self.device_service(dev).is_some_and(|s| s.has_params())
    }

    pub fn param_count(&self, dev: DeviceId) -> usize {
        self.device_service(dev).map_or(0, |s| s.param_count())
    }

    /// Find a parameter by its plugin-native id. Invalid while the device
    /// hasn't finished being created.
    pub fn find_param(&self, dev: DeviceId, param_id: u32) -> ParamIdx {
        self.device_service(dev).map_or(ParamIdx::INVALID, |s| s.find_param(param_id))
    }

    pub fn param_info(&self, dev: DeviceId, param: ParamIdx) -> Option<ParamInfo> {
        self.device_service(dev).and_then(|s| s.param_info(param))
    }

    pub fn get_param_value(&self, dev: DeviceId, param: ParamIdx, cb: ReturnDouble) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            let callback = service.returns.doubles.put(cb);
            service.enqueue(ClientMsg::GetParamValue { dev, param_idx: param.0, callback });
        })
    }

    pub fn get_param_value_text(
        &self,
        dev: DeviceId,
        param: ParamIdx,
        value: f64,
        cb: ReturnString,
    ) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            let callback = service.returns.strings.put(cb);
            service.enqueue(ClientMsg::GetParamValueText {
                dev,
                param_idx: param.0,
                value,
                callback,
            });
        })
    }

    /// Save the device's opaque state blob.
    pub fn save_async(&self, dev: DeviceId, cb: ReturnBytes) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            let callback = service.returns.bytes.put(cb);
            service.enqueue(ClientMsg::DeviceSave { dev, callback });
        })
    }

    /// Load an opaque state blob into the device.
    pub fn load_async(&self, dev: DeviceId, state: Vec<u8>, cb: ReturnDevice) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            let callback = service.returns.devices.put(cb);
            service.enqueue(ClientMsg::DeviceLoad { dev, state, callback });
        })
    }

    /// Push one event to the device for the next buffer.
    pub fn push_event(&self, dev: DeviceId, event: Event) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            service.enqueue(ClientMsg::Event { dev, event });
        })
    }

    pub fn gui_show(&self, dev: DeviceId) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            service.enqueue(ClientMsg::DeviceGuiShow { dev });
        })
    }

    pub fn gui_hide(&self, dev: DeviceId) -> Result<()> {
        self.with_device_sandbox(dev, |service| {
            service.enqueue(ClientMsg::DeviceGuiHide { dev });
        })
    }

    pub fn close_all_editors(&self) {
        self.inner.model.with(|m| {
            for sandbox in m.sandboxes.values() {
                if sandbox.service.is_running() {
                    sandbox.service.enqueue(ClientMsg::CloseAllEditors);
                }
            }
        });
    }

    /// Test support: make a sandbox crash on purpose.
    pub fn crash_sandbox(&self, sbox: SandboxId) -> Result<()> {
        self.inner.model.with(|m| {
            m.sandbox(sbox)?.service.enqueue(ClientMsg::Crash);
            Ok(())
        })
    }

    // -- connections --------------------------------------------------------

    /// Connect `(out_dev, out_port)` to `(in_dev, in_port)`. The devices
    /// may live in different sandboxes of the same group.
    pub fn connect(
        &self,
        out_dev: DeviceId,
        out_port: usize,
        in_dev: DeviceId,
        in_port: usize,
    ) -> Result<()> {
        if out_port >= MAX_AUDIO_PORTS || in_port >= MAX_AUDIO_PORTS {
            return Err(Error::Topology(format!(
                "port index out of range ({out_port} or {in_port} >= {MAX_AUDIO_PORTS})"
            )));
        }
        self.inner.model.modify(|m| {
            m.validate_connection(out_dev, in_dev)?;
            let conn = OutputConn { this_port: out_port, peer_dev: in_dev, peer_port: in_port };
            let device = m.devices.get_mut(&out_dev).expect("validated above");
            if !device.conns.contains(&conn) {
                device.conns.push(conn);
            }
            send_connect_messages(m, out_dev, out_port, in_dev, in_port);
            Ok(())
        })
    }

    pub fn disconnect(
        &self,
        out_dev: DeviceId,
        out_port: usize,
        in_dev: DeviceId,
        in_port: usize,
    ) -> Result<()> {
        self.inner.model.modify(|m| {
            m.validate_connection(out_dev, in_dev)?;
            let device = m.devices.get_mut(&out_dev).expect("validated above");
            device.conns.retain(|c| {
                !(c.this_port == out_port && c.peer_dev == in_dev && c.peer_port == in_port)
            });
            let out_sbox = m.device(out_dev)?.sbox;
            let in_sbox = m.device(in_dev)?.sbox;
            let msg = ClientMsg::DeviceDisconnect { out_dev, out_port, in_dev, in_port };
            m.sandbox(out_sbox)?.service.enqueue(msg.clone());
            if in_sbox != out_sbox {
                m.sandbox(in_sbox)?.service.enqueue(msg);
            }
            Ok(())
        })
    }

    // -- plugins / plugfiles ------------------------------------------------

    pub fn find_plugin(&self, ext_id: &str, format: PluginFormat) -> Option<PluginId> {
        self.inner.model.with(|m| m.find_plugin(ext_id, format).map(|p| p.id))
    }

    pub fn plugin(&self, id: PluginId) -> Option<Plugin> {
        self.inner.model.with(|m| m.plugins.get(&id).cloned())
    }

    pub fn plugfile(&self, id: soundproof_core::ids::PlugfileId) -> Option<Plugfile> {
        self.inner.model.with(|m| m.plugfiles.get(&id).cloned())
    }

    pub fn working_plugins(&self) -> Vec<PluginId> {
        self.inner.model.with(|m| {
            m.plugins.values().filter(|p| p.error.is_empty()).map(|p| p.id).collect()
        })
    }

    pub fn broken_plugins(&self) -> Vec<PluginId> {
        self.inner.model.with(|m| {
            m.plugins.values().filter(|p| !p.error.is_empty()).map(|p| p.id).collect()
        })
    }

    pub fn broken_plugfiles(&self) -> Vec<soundproof_core::ids::PlugfileId> {
        self.inner.model.with(|m| {
            m.plugfiles.values().filter(|p| !p.error.is_empty()).map(|p| p.id).collect()
        })
    }

    pub fn has_rack_features(&self, id: PluginId) -> bool {
        self.inner.model.with(|m| m.plugins.get(&id).is_some_and(Plugin::has_rack_features))
    }

    // -- scanning -----------------------------------------------------------

    /// Scan the system for plugins. A running scan is restarted.
    pub fn scan(&self, scanner_exe: &Path, flags: ScanFlags) {
        crate::scan::start_scan(&self.inner, scanner_exe, flags);
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::Acquire)
    }

    // -- helpers ------------------------------------------------------------

    fn device_service(&self, dev: DeviceId) -> Option<Arc<ClientDeviceService>> {
        self.inner.model.with(|m| m.devices.get(&dev).and_then(|d| d.service.clone()))
    }

    fn with_device_sandbox(
        &self,
        dev: DeviceId,
        f: impl FnOnce(&SandboxService),
    ) -> Result<()> {
        self.inner.model.with(|m| {
            let device = m.device(dev)?;
            let sandbox = m.sandbox(device.sbox)?;
            f(&sandbox.service);
            Ok(())
        })
    }
}

pub(crate) fn instance_from(inner: &Arc<Inner>) -> Instance {
    Instance { inner: Arc::clone(inner) }
}

#[cfg(test)]
impl Instance {
    pub(crate) fn test_inner(&self) -> Arc<Inner> {
        Arc::clone(&self.inner)
    }
}

fn spawn_sandbox(
    exe: &Path,
    group_shmid: &str,
    sbox_shmid: &str,
    sample_rate: f64,
    instance_id: &str,
) -> std::io::Result<std::process::Child> {
    Command::new(exe)
        .arg("--group")
        .arg(group_shmid)
        .arg("--sandbox")
        .arg(sbox_shmid)
        .arg("--sr")
        .arg(sample_rate.to_string())
        .arg("--instance-id")
        .arg(instance_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
}

/// Send a connect message to the involved sandboxes: one message when both
/// endpoints share a sandbox, both sides otherwise.
pub(crate) fn send_connect_messages(
    m: &Model,
    out_dev: DeviceId,
    out_port: usize,
    in_dev: DeviceId,
    in_port: usize,
) {
    let (Some(out), Some(inp)) = (m.devices.get(&out_dev), m.devices.get(&in_dev)) else {
        return;
    };
    let out_ports_shmid =
        out.service.as_ref().map(|s| s.ports.id().to_string()).unwrap_or_default();
    let msg = ClientMsg::DeviceConnect {
        out_dev,
        out_port,
        out_ports_shmid,
        in_dev,
        in_port,
    };
    if let Some(sandbox) = m.sandboxes.get(&out.sbox) {
        sandbox.service.enqueue(msg.clone());
    }
    if inp.sbox != out.sbox {
        if let Some(sandbox) = m.sandboxes.get(&inp.sbox) {
            sandbox.service.enqueue(msg);
        }
    }
}

/// Send the `DeviceCreate` message for an already-inserted device whose
/// plugin is resolved, parking `cb` in the sandbox's device slot buffer.
///
/// On failure the continuation is handed back so the caller can invoke it
/// *after* releasing the model lock -- continuations are free to call back
/// into the instance.
pub(crate) fn enqueue_device_create(
    m: &mut Model,
    dev: DeviceId,
    cb: ReturnDevice,
) -> std::result::Result<(), ReturnDevice> {
    let Some(device) = m.devices.get(&dev) else {
        return Err(cb);
    };
    let Some(plugin) = m.plugins.get(&device.plugin) else {
        return Err(cb);
    };
    let plugfile_path =
        m.plugfiles.get(&plugin.plugfile).map(|pf| pf.path.clone()).unwrap_or_default();
    let Some(sandbox) = m.sandboxes.get(&device.sbox) else {
        return Err(cb);
    };
    let callback = sandbox.service.returns.devices.put(cb);
    sandbox.service.enqueue(ClientMsg::DeviceCreate {
        dev,
        format: device.format,
        plugfile_path,
        plugin_ext_id: device.plugin_ext_id.clone(),
        callback,
    });
    Ok(())
}

/// Continuation that reports a late/re-create outcome on the group queue.
pub(crate) fn late_create_callback(inner: &Arc<Inner>, sbox: SandboxId) -> ReturnDevice {
    let weak = Arc::downgrade(inner);
    Box::new(move |dev, success| {
        if let Some(inner) = weak.upgrade() {
            inner.model.with(|m| {
                inner.report_for_sandbox(m, sbox, GroupReport::DeviceLateCreate { dev, success });
            });
        }
    })
}

/// Insert a device entry with a caller-chosen id and fire off its create.
/// Shared by `create_device`, `duplicate`, and scan-driven revival.
pub(crate) fn create_device_with_id(
    inner: &Arc<Inner>,
    id: DeviceId,
    sbox: SandboxId,
    format: PluginFormat,
    plugin_ext_id: &str,
    cb: ReturnDevice,
) -> Result<()> {
    // Continuations run outside the model lock.
    let mut failed_cb: Option<ReturnDevice> = None;
    let result = inner.model.modify(|m| {
        let sandbox = m.sandbox(sbox)?;
        let group = sandbox.group;
        let plugin = m.find_plugin(plugin_ext_id, format).map_or(PluginId::INVALID, |p| p.id);
        let name = m.plugins.get(&plugin).map(|p| p.name.clone()).unwrap_or_default();
        m.devices.insert(
            id,
            Device {
                id,
                sbox,
                plugin,
                format,
                plugin_ext_id: plugin_ext_id.to_string(),
                error: String::new(),
                name,
                conns: Vec::new(),
                service: None,
            },
        );
        m.add_device_to_sandbox(sbox, id);
        if plugin.is_valid() {
            if let Err(cb) = enqueue_device_create(m, id, cb) {
                m.set_device_error(id, "sandbox unavailable");
                failed_cb = Some(cb);
            }
        } else {
            let error = "Plugin not found.";
            m.set_device_error(id, error);
            inner.report_group(
                m,
                group,
                GroupReport::DeviceError { dev: id, error: error.to_string() },
            );
            failed_cb = Some(cb);
        }
        Ok(())
    });
    if let Some(cb) = failed_cb {
        cb(id, false);
    }
    result
}

// -- poll thread ------------------------------------------------------------

fn poll_thread(inner: &Arc<Inner>) {
    tracing::debug!("poll thread started");
    let mut next_gc = Instant::now() + Duration::from_millis(GC_INTERVAL_MS);
    let mut next_heartbeat = Instant::now();
    while !inner.stop.load(Ordering::Acquire) {
        let now = Instant::now();
        let heartbeat_due = now >= next_heartbeat;
        if heartbeat_due {
            next_heartbeat = now + Duration::from_millis(HEARTBEAT_INTERVAL_MS);
        }
        poll_iteration(inner, heartbeat_due);
        if now >= next_gc {
            inner.model.garbage_collect();
            next_gc = now + Duration::from_millis(GC_INTERVAL_MS);
        }
        std::thread::sleep(Duration::from_millis(POLL_SLEEP_MS));
    }
    tracing::debug!("poll thread stopped");
}

fn poll_iteration(inner: &Arc<Inner>, heartbeat_due: bool) {
    let sandboxes: Vec<(SandboxId, Arc<SandboxService>)> = inner
        .model
        .with(|m| m.sandboxes.values().map(|s| (s.id, Arc::clone(&s.service))).collect());

    for (sbox, service) in sandboxes {
        let has_child = service.child.lock().is_some();
        let running = service.is_running();
        if heartbeat_due && running {
            service.enqueue(ClientMsg::Heartbeat);
        }
        service.send_msgs();
        match service.receive_msgs() {
            Ok(msgs) => {
                for msg in msgs {
                    dispatch_sandbox_msg(inner, sbox, msg);
                }
            }
            Err(err) => {
                inner.model.with(|m| {
                    inner.report_for_sandbox(
                        m,
                        sbox,
                        GroupReport::SboxError { sbox, error: format!("transport error: {err}") },
                    );
                });
            }
        }
        // A sandbox that never had a child (spawn failure) was reported at
        // creation; "crashed" means a once-running child is gone.
        if has_child && !running && !service.crash_reported.swap(true, Ordering::AcqRel) {
            handle_sandbox_crash(inner, sbox, &service);
        }
    }

    // Surface realtime timeouts recorded by the audio thread.
    let groups: Vec<(GroupId, Arc<GroupService>)> = inner
        .model
        .with(|m| m.groups.values().map(|g| (g.id, Arc::clone(&g.service))).collect());
    for (group, service) in groups {
        let timeouts = service.take_timeouts();
        if timeouts > 0 {
            inner.model.with(|m| {
                inner.report_group(
                    m,
                    group,
                    GroupReport::Error {
                        error: format!("group {group}: {timeouts} buffer(s) lost to timeouts"),
                    },
                );
            });
        }
    }
}

fn handle_sandbox_crash(inner: &Arc<Inner>, sbox: SandboxId, service: &SandboxService) {
    tracing::warn!("sandbox {sbox} is down");
    // Fail every in-flight continuation.
    for cb in service.returns.devices.drain() {
        cb(DeviceId::INVALID, false);
    }
    service.returns.doubles.drain();
    service.returns.strings.drain();
    service.returns.bytes.drain();

    inner.model.modify(|m| {
        let last_error = m.sandboxes.get(&sbox).map(|s| s.error.clone()).unwrap_or_default();
        let devices: Vec<DeviceId> =
            m.sandboxes.get(&sbox).map(|s| s.devices.iter().copied().collect()).unwrap_or_default();
        if let Some(sandbox) = m.sandboxes.get_mut(&sbox) {
            if sandbox.error.is_empty() {
                "sandbox process exited".clone_into(&mut sandbox.error);
            }
        }
        for dev in devices {
            m.set_device_error(dev, "sandbox crashed");
        }
        inner.report_for_sandbox(
            m,
            sbox,
            GroupReport::SboxCrashed {
                sbox,
                error: if last_error.is_empty() {
                    "sandbox process exited".to_string()
                } else {
                    last_error
                },
            },
        );
    });
}

fn dispatch_sandbox_msg(inner: &Arc<Inner>, sbox: SandboxId, msg: SandboxMsg) {
    match msg {
        SandboxMsg::ConfirmActivated => {
            tracing::debug!("sandbox {sbox} confirmed activation");
        }
        SandboxMsg::DeviceEditorVisibleChanged { dev, visible, native_handle } => {
            tracing::debug!("device {dev} editor visible={visible} handle={native_handle:#x}");
        }
        SandboxMsg::DeviceParamInfoChanged { dev, new_shmid } => {
            let service = inner.model.with(|m| m.devices.get(&dev).and_then(|d| d.service.clone()));
            match service {
                Some(service) => match service.replace_params(&new_shmid) {
                    Ok(()) => inner.model.with(|m| {
                        inner.report_for_sandbox(m, sbox, GroupReport::DeviceParamsChanged { dev });
                    }),
                    Err(err) => inner.model.with(|m| {
                        inner.report_for_sandbox(
                            m,
                            sbox,
                            GroupReport::DeviceError { dev, error: err.to_string() },
                        );
                    }),
                },
                None => tracing::warn!("param info change for unknown device {dev}"),
            }
        }
        SandboxMsg::ReportError { text } => {
            inner.model.with(|m| {
                inner.report_for_sandbox(m, sbox, GroupReport::SboxError { sbox, error: text });
            });
        }
        SandboxMsg::ReportFatalError { text } => {
            inner.model.modify(|m| {
                if let Some(sandbox) = m.sandboxes.get_mut(&sbox) {
                    text.clone_into(&mut sandbox.error);
                }
                inner.report_for_sandbox(m, sbox, GroupReport::SboxError { sbox, error: text.clone() });
            });
        }
        SandboxMsg::ReportInfo { text } => {
            inner.model.with(|m| {
                inner.report_for_sandbox(m, sbox, GroupReport::SboxInfo { sbox, info: text });
            });
        }
        SandboxMsg::ReportWarning { text } => {
            inner.model.with(|m| {
                inner.report_for_sandbox(m, sbox, GroupReport::SboxWarning { sbox, warning: text });
            });
        }
        SandboxMsg::ReturnCreatedDevice { dev, dev_shmid, ports_shmid, params_shmid, error, callback } => {
            handle_return_created_device(
                inner, sbox, dev, &dev_shmid, &ports_shmid, &params_shmid, &error, callback,
            );
        }
        SandboxMsg::ReturnLoadResult { dev, error, callback } => {
            let cb = inner.model.with(|m| {
                m.sandboxes.get(&sbox).and_then(|s| s.service.returns.devices.take(callback))
            });
            let success = error.is_empty();
            if !success {
                inner.model.with(|m| {
                    inner.report_for_sandbox(m, sbox, GroupReport::DeviceError { dev, error });
                });
            }
            if let Some(cb) = cb {
                cb(dev, success);
            }
        }
        SandboxMsg::ReturnParamValue { value, callback } => {
            let cb = inner.model.with(|m| {
                m.sandboxes.get(&sbox).and_then(|s| s.service.returns.doubles.take(callback))
            });
            if let Some(cb) = cb {
                cb(value);
            }
        }
        SandboxMsg::ReturnParamValueText { text, callback } => {
            let cb = inner.model.with(|m| {
                m.sandboxes.get(&sbox).and_then(|s| s.service.returns.strings.take(callback))
            });
            if let Some(cb) = cb {
                cb(text);
            }
        }
        SandboxMsg::ReturnState { bytes, callback } => {
            let cb = inner.model.with(|m| {
                m.sandboxes.get(&sbox).and_then(|s| s.service.returns.bytes.take(callback))
            });
            if let Some(cb) = cb {
                cb(bytes);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_return_created_device(
    inner: &Arc<Inner>,
    sbox: SandboxId,
    dev: DeviceId,
    dev_shmid: &str,
    ports_shmid: &str,
    params_shmid: &str,
    error: &str,
    callback: u64,
) {
    let cb = inner
        .model
        .with(|m| m.sandboxes.get(&sbox).and_then(|s| s.service.returns.devices.take(callback)));
    if error.is_empty() {
        match ClientDeviceService::open(dev_shmid, ports_shmid, params_shmid) {
            Ok(service) => {
                let service = Arc::new(service);
                inner.model.modify(|m| {
                    if let Some(device) = m.devices.get_mut(&dev) {
                        device.service = Some(service);
                        device.error.clear();
                    }
                    // Connections recorded before the remote device existed
                    // (restart, late create) need their shm ids re-sent.
                    let replays: Vec<(DeviceId, OutputConn)> = m
                        .devices
                        .values()
                        .filter(|d| d.id == dev || d.conns.iter().any(|c| c.peer_dev == dev))
                        .flat_map(|d| d.conns.iter().map(move |c| (d.id, *c)))
                        .collect();
                    for (out_dev, conn) in replays {
                        send_connect_messages(m, out_dev, conn.this_port, conn.peer_dev, conn.peer_port);
                    }
                });
                if let Some(cb) = cb {
                    cb(dev, true);
                }
            }
            Err(err) => {
                inner.model.modify(|m| {
                    m.set_device_error(dev, &err.to_string());
                    inner.report_for_sandbox(
                        m,
                        sbox,
                        GroupReport::DeviceError { dev, error: err.to_string() },
                    );
                });
                if let Some(cb) = cb {
                    cb(dev, false);
                }
            }
        }
    } else {
        inner.model.modify(|m| {
            m.set_device_error(dev, error);
            inner.report_for_sandbox(
                m,
                sbox,
                GroupReport::DeviceError { dev, error: error.to_string() },
            );
        });
        if let Some(cb) = cb {
            cb(dev, false);
        }
    }
}
