//! Reporter messages.
//!
//! Asynchronous happenings are queued and delivered only when the host
//! application polls [`Instance::receive_reports`] /
//! [`Instance::receive_group_reports`], so delivery runs on whichever
//! non-realtime thread the host chooses. If the host never polls, reports
//! pile up and consume memory.
//!
//! [`Instance::receive_reports`]: crate::Instance::receive_reports
//! [`Instance::receive_group_reports`]: crate::Instance::receive_group_reports

use soundproof_core::ids::{DeviceId, PlugfileId, PluginId, SandboxId};

/// Instance-wide reports, mostly about scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralReport {
    ScanStarted,
    ScanComplete,
    ScanError { error: String },
    ScanWarning { warning: String },
    PlugfileScanned { plugfile: PlugfileId },
    PlugfileBroken { plugfile: PlugfileId },
    PluginScanned { plugin: PluginId },
    PluginBroken { plugin: PluginId },
    Error { error: String },
}

/// Per-group reports about devices and sandboxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupReport {
    DeviceError { dev: DeviceId, error: String },
    DeviceParamsChanged { dev: DeviceId },
    /// A device stuck in plugin-unknown error state was re-created after a
    /// scan found its plugin.
    DeviceLateCreate { dev: DeviceId, success: bool },
    Error { error: String },
    SboxStarted { sbox: SandboxId },
    SboxError { sbox: SandboxId, error: String },
    SboxInfo { sbox: SandboxId, info: String },
    SboxWarning { sbox: SandboxId, warning: String },
    SboxCrashed { sbox: SandboxId, error: String },
}
