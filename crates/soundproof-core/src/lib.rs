//! Core types, constants, and identifiers shared across the soundproof ecosystem.
//!
//! Everything in here is plain data. The shared-memory layouts in
//! `soundproof-ipc` embed these types directly, so the sized ones are
//! `#[repr(C)]` and `Copy`.

pub mod events;
pub mod ids;
pub mod params;

/// Samples per channel in one processing buffer.
pub const VECTOR_SIZE: usize = 64;

/// Channels per audio port. Hard-coded stereo for now.
pub const CHANNEL_COUNT: usize = 2;

/// Floats in one audio port buffer (`[channel][sample]`, channel-major).
pub const SAMPLES_PER_PORT: usize = CHANNEL_COUNT * VECTOR_SIZE;

/// Maximum audio ports per direction on a single device.
pub const MAX_AUDIO_PORTS: usize = 16;

/// Maximum parameters per device.
pub const MAX_PARAMS: usize = 512;

/// Maximum events per event buffer side. Surplus events are dropped.
pub const EVENT_PORT_SIZE: usize = 128;

/// Capacity of one shared message byte ring.
pub const MSG_BUFFER_SIZE: usize = 4096;

/// Maximum stored length of a parameter name, in bytes.
pub const PARAM_NAME_MAX: usize = 64;

/// Sleep between iterations of the non-realtime polling loops.
pub const POLL_SLEEP_MS: u64 = 10;

/// Interval between garbage collections of retired model snapshots.
pub const GC_INTERVAL_MS: u64 = 1000;

/// Interval between client heartbeats to each sandbox.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// A sandbox that hasn't heard a heartbeat for this long assumes the client
/// died and terminates itself.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 5000;

/// File extension of CLAP plugin files.
pub const CLAP_EXT: &str = "clap";

/// File extension of VST3 plugin files.
pub const VST3_EXT: &str = "vst3";

/// Plugin file formats understood by the system.
///
/// The core never branches on this outside the adapter boundary; it is a tag
/// carried through messages and the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PluginFormat {
    #[default]
    Unknown = 0,
    Clap = 1,
    Vst3 = 2,
}

impl PluginFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clap => "clap",
            Self::Vst3 => "vst3",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "clap" => Self::Clap,
            "vst3" => Self::Vst3,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Clap,
            2 => Self::Vst3,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a device is processing live or rendering offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RenderMode {
    #[default]
    Realtime = 0,
    Offline = 1,
}

impl RenderMode {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        if value == 1 { Self::Offline } else { Self::Realtime }
    }
}

/// Common error type for control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shared-memory or message-transport failure
    #[error("ipc error: {0}")]
    Ipc(String),

    /// Operation against a missing or mismatched entity
    #[error("topology error: {0}")]
    Topology(String),

    /// A sandbox process misbehaved or could not be driven
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Plugin could not be resolved or loaded
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Scanner subprocess failure
    #[error("scan error: {0}")]
    Scan(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_format_names() {
        assert_eq!(PluginFormat::Clap.as_str(), "clap");
        assert_eq!(PluginFormat::from_name("vst3"), PluginFormat::Vst3);
        assert_eq!(PluginFormat::from_name("bogus"), PluginFormat::Unknown);
        for format in [PluginFormat::Unknown, PluginFormat::Clap, PluginFormat::Vst3] {
            assert_eq!(PluginFormat::from_u8(format as u8), format);
        }
    }

    #[test]
    fn test_buffer_geometry() {
        assert_eq!(SAMPLES_PER_PORT, 128);
        assert!(EVENT_PORT_SIZE.is_power_of_two());
    }
}
