//! The client's topology model.
//!
//! A plain value type: entities refer to each other by id only, and the
//! whole model is cloned per published snapshot (entities keep their heavy
//! shared state behind `Arc`ed services, so a clone is table-sized, not
//! segment-sized). The audio thread reads snapshots published through
//! [`AudioSync`](soundproof_comms::AudioSync); erasure here is logical and
//! backing resources die with the last snapshot referencing them.

use crate::service::{ClientDeviceService, GroupService, SandboxService};
use soundproof_core::ids::{DeviceId, GroupId, PlugfileId, PluginId, SandboxId};
use soundproof_core::{Error, PluginFormat, RenderMode, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A directed audio edge out of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConn {
    pub this_port: usize,
    pub peer_dev: DeviceId,
    pub peer_port: usize,
}

#[derive(Clone)]
pub struct Device {
    pub id: DeviceId,
    pub sbox: SandboxId,
    /// Resolved plugin, or invalid while the plugin is unknown.
    pub plugin: PluginId,
    pub format: PluginFormat,
    pub plugin_ext_id: String,
    /// Empty iff healthy.
    pub error: String,
    pub name: String,
    pub conns: Vec<OutputConn>,
    /// Present once the sandbox has created the remote device.
    pub service: Option<Arc<ClientDeviceService>>,
}

impl Device {
    pub fn was_loaded_successfully(&self) -> bool {
        self.error.is_empty() && self.service.is_some()
    }
}

#[derive(Clone)]
pub struct Sandbox {
    pub id: SandboxId,
    pub group: GroupId,
    /// Empty iff healthy.
    pub error: String,
    pub devices: BTreeSet<DeviceId>,
    pub service: Arc<SandboxService>,
}

#[derive(Clone)]
pub struct Group {
    pub id: GroupId,
    pub sample_rate: f64,
    pub render_mode: RenderMode,
    pub active: bool,
    pub no_reporting: bool,
    pub sandboxes: BTreeSet<SandboxId>,
    pub service: Arc<GroupService>,
}

#[derive(Clone, Default)]
pub struct Plugin {
    pub id: PluginId,
    pub plugfile: PlugfileId,
    pub ext_id: String,
    pub format: PluginFormat,
    pub error: String,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub features: Vec<String>,
}

impl Plugin {
    /// Whether this plugin fits a device rack: an effect or analyzer.
    pub fn has_rack_features(&self) -> bool {
        self.features.iter().any(|f| f == "audio-effect" || f == "analyzer")
    }
}

#[derive(Clone, Default)]
pub struct Plugfile {
    pub id: PlugfileId,
    pub format: PluginFormat,
    pub path: String,
    pub error: String,
}

#[derive(Clone, Default)]
pub struct Model {
    pub devices: HashMap<DeviceId, Device>,
    pub groups: HashMap<GroupId, Group>,
    pub sandboxes: HashMap<SandboxId, Sandbox>,
    pub plugins: HashMap<PluginId, Plugin>,
    pub plugfiles: HashMap<PlugfileId, Plugfile>,
}

impl Model {
    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices.get(&id).ok_or_else(|| Error::Topology(format!("no device {id}")))
    }

    pub fn sandbox(&self, id: SandboxId) -> Result<&Sandbox> {
        self.sandboxes.get(&id).ok_or_else(|| Error::Topology(format!("no sandbox {id}")))
    }

    pub fn group(&self, id: GroupId) -> Result<&Group> {
        self.groups.get(&id).ok_or_else(|| Error::Topology(format!("no group {id}")))
    }

    pub fn add_device_to_sandbox(&mut self, sbox: SandboxId, dev: DeviceId) {
        if let Some(sandbox) = self.sandboxes.get_mut(&sbox) {
            sandbox.devices.insert(dev);
        }
    }

    pub fn remove_device_from_sandbox(&mut self, sbox: SandboxId, dev: DeviceId) {
        if let Some(sandbox) = self.sandboxes.get_mut(&sbox) {
            sandbox.devices.remove(&dev);
        }
    }

    pub fn add_sandbox_to_group(&mut self, group: GroupId, sbox: SandboxId) {
        if let Some(group) = self.groups.get_mut(&group) {
            group.sandboxes.insert(sbox);
        }
    }

    pub fn remove_sandbox_from_group(&mut self, group: GroupId, sbox: SandboxId) {
        if let Some(group) = self.groups.get_mut(&group) {
            group.sandboxes.remove(&sbox);
        }
    }

    pub fn set_device_error(&mut self, dev: DeviceId, error: &str) {
        if let Some(device) = self.devices.get_mut(&dev) {
            error.clone_into(&mut device.error);
        }
    }

    /// Remove a device and the connections pointing at it.
    pub fn erase_device(&mut self, dev: DeviceId) {
        if let Some(device) = self.devices.remove(&dev) {
            self.remove_device_from_sandbox(device.sbox, dev);
        }
        for device in self.devices.values_mut() {
            device.conns.retain(|c| c.peer_dev != dev);
        }
    }

    /// Remove a sandbox together with everything it hosts.
    pub fn erase_sandbox(&mut self, sbox: SandboxId) {
        let Some(sandbox) = self.sandboxes.remove(&sbox) else {
            return;
        };
        self.remove_sandbox_from_group(sandbox.group, sbox);
        for dev in sandbox.devices {
            self.erase_device(dev);
        }
    }

    pub fn find_plugin(&self, ext_id: &str, format: PluginFormat) -> Option<&Plugin> {
        self.plugins
            .values()
            .find(|p| p.ext_id == ext_id && (format == PluginFormat::Unknown || p.format == format))
    }

    pub fn find_plugfile_by_path(&self, path: &str) -> Option<&Plugfile> {
        self.plugfiles.values().find(|pf| pf.path == path)
    }

    /// Validate a `(out, port) -> (in, port)` connection: both devices must
    /// exist and their sandboxes must share a group.
    pub fn validate_connection(&self, out_dev: DeviceId, in_dev: DeviceId) -> Result<GroupId> {
        let out = self.device(out_dev)?;
        let inp = self.device(in_dev)?;
        let out_group = self.sandbox(out.sbox)?.group;
        let in_group = self.sandbox(inp.sbox)?.group;
        if out_group != in_group {
            return Err(Error::Topology(format!(
                "devices {out_dev} and {in_dev} are in different groups"
            )));
        }
        Ok(out_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::GroupService;

    fn unique(tag: &str) -> String {
        format!("sp-test-model-{tag}-{}", std::process::id())
    }

    fn model_with_group_and_sandbox(tag: &str) -> (Model, GroupId, SandboxId) {
        let mut m = Model::default();
        let group_id = GroupId(0);
        let sbox_id = SandboxId(0);
        let group_service = Arc::new(GroupService::create(&unique(tag)).unwrap());
        m.groups.insert(
            group_id,
            Group {
                id: group_id,
                sample_rate: 48000.0,
                render_mode: RenderMode::Realtime,
                active: false,
                no_reporting: false,
                sandboxes: BTreeSet::new(),
                service: group_service,
            },
        );
        let sbox_service = Arc::new(SandboxService::create(&format!("{}-s", unique(tag))).unwrap());
        m.sandboxes.insert(
            sbox_id,
            Sandbox {
                id: sbox_id,
                group: group_id,
                error: String::new(),
                devices: BTreeSet::new(),
                service: sbox_service,
            },
        );
        m.add_sandbox_to_group(group_id, sbox_id);
        (m, group_id, sbox_id)
    }

    fn insert_device(m: &mut Model, id: i64, sbox: SandboxId) -> DeviceId {
        let dev = DeviceId(id);
        m.devices.insert(
            dev,
            Device {
                id: dev,
                sbox,
                plugin: PluginId::INVALID,
                format: PluginFormat::Clap,
                plugin_ext_id: format!("test.plugin.{id}"),
                error: String::new(),
                name: String::new(),
                conns: Vec::new(),
                service: None,
            },
        );
        m.add_device_to_sandbox(sbox, dev);
        dev
    }

    #[test]
    fn test_device_sandbox_membership_is_symmetric() {
        let (mut m, _group, sbox) = model_with_group_and_sandbox("sym");
        let dev = insert_device(&mut m, 1, sbox);
        assert!(m.sandboxes[&sbox].devices.contains(&dev));
        assert_eq!(m.devices[&dev].sbox, sbox);
        m.erase_device(dev);
        assert!(!m.sandboxes[&sbox].devices.contains(&dev));
    }

    #[test]
    fn test_erase_sandbox_erases_its_devices() {
        let (mut m, group, sbox) = model_with_group_and_sandbox("cascade");
        let d1 = insert_device(&mut m, 1, sbox);
        let d2 = insert_device(&mut m, 2, sbox);
        m.erase_sandbox(sbox);
        assert!(m.devices.get(&d1).is_none());
        assert!(m.devices.get(&d2).is_none());
        assert!(!m.groups[&group].sandboxes.contains(&sbox));
    }

    #[test]
    fn test_erase_device_removes_inbound_connections() {
        let (mut m, _group, sbox) = model_with_group_and_sandbox("conns");
        let d1 = insert_device(&mut m, 1, sbox);
        let d2 = insert_device(&mut m, 2, sbox);
        m.devices.get_mut(&d1).unwrap().conns.push(OutputConn {
            this_port: 0,
            peer_dev: d2,
            peer_port: 0,
        });
        m.erase_device(d2);
        assert!(m.devices[&d1].conns.is_empty());
    }

    #[test]
    fn test_connection_validation() {
        let (mut m, _group, sbox) = model_with_group_and_sandbox("validate");
        let d1 = insert_device(&mut m, 1, sbox);
        let d2 = insert_device(&mut m, 2, sbox);
        assert!(m.validate_connection(d1, d2).is_ok());
        assert!(m.validate_connection(d1, DeviceId(99)).is_err());
    }

    #[test]
    fn test_find_plugin_by_ext_id() {
        let mut m = Model::default();
        m.plugins.insert(
            PluginId(7),
            Plugin {
                id: PluginId(7),
                ext_id: "studio.kx.distrho.MaGigaverb".to_string(),
                format: PluginFormat::Clap,
                ..Plugin::default()
            },
        );
        assert!(m.find_plugin("studio.kx.distrho.MaGigaverb", PluginFormat::Clap).is_some());
        assert!(m.find_plugin("studio.kx.distrho.MaGigaverb", PluginFormat::Vst3).is_none());
        assert!(m.find_plugin("other", PluginFormat::Clap).is_none());
    }

    #[test]
    fn test_rack_features() {
        let plugin = Plugin {
            features: vec!["stereo".to_string(), "audio-effect".to_string()],
            ..Plugin::default()
        };
        assert!(plugin.has_rack_features());
        let instrument = Plugin { features: vec!["instrument".to_string()], ..Plugin::default() };
        assert!(!instrument.has_rack_features());
    }
}
