//! Plugin adapter abstraction layer.
//!
//! This crate defines the common [`PluginAdapter`] trait that the host side
//! of every plugin format (CLAP, VST3, ...) implements. A sandbox drives its
//! devices exclusively through this trait; nothing outside an adapter ever
//! branches on the plugin format.

pub mod builtin;

use soundproof_core::RenderMode;
use soundproof_core::events::{Event, EventList};
use soundproof_core::params::ParamInfo;

/// Static facts about an instantiated plugin.
#[derive(Debug, Clone, Default)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    /// The plugin's own external id string (e.g. a CLAP plugin id).
    pub ext_id: String,
    pub has_gui: bool,
    pub has_params: bool,
    pub audio_in_ports: usize,
    pub audio_out_ports: usize,
}

/// Buffers for one processing call.
///
/// Audio slices are `CHANNEL_COUNT * VECTOR_SIZE` floats per port, laid out
/// channel-major (`[channel][sample]`).
pub struct ProcessIo<'a> {
    pub audio_in: &'a [&'a [f32]],
    pub audio_out: &'a mut [&'a mut [f32]],
    pub events_in: &'a [Event],
    pub events_out: &'a mut EventList,
}

/// Host-side adapter for one plugin instance.
///
/// Methods other than [`process`](Self::process) are called from the sandbox
/// main thread. `process` runs on the sandbox audio worker and must not
/// allocate or block.
pub trait PluginAdapter: Send {
    fn info(&self) -> &AdapterInfo;

    fn activate(&mut self, sample_rate: f64) -> Result<(), AdapterError>;

    fn deactivate(&mut self);

    fn process(&mut self, io: &mut ProcessIo<'_>) -> Result<(), AdapterError>;

    /// Current parameter table. May change after a state load; the sandbox
    /// republishes the shared param-info table when it does.
    fn param_infos(&mut self) -> Vec<ParamInfo>;

    fn param_value(&mut self, index: usize) -> Result<f64, AdapterError>;

    fn param_value_text(&mut self, index: usize, value: f64) -> Result<String, AdapterError>;

    fn save_state(&mut self) -> Result<Vec<u8>, AdapterError>;

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), AdapterError>;

    fn set_render_mode(&mut self, mode: RenderMode);

    /// Show the plugin editor and return its native window handle.
    fn gui_show(&mut self) -> Result<i64, AdapterError> {
        Err(AdapterError::NoGui)
    }

    fn gui_hide(&mut self) {}
}

/// Adapter-related errors
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("plugin instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("plugin activation failed: {0}")]
    ActivationFailed(String),

    #[error("plugin processing failed: {0}")]
    ProcessingFailed(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("state error: {0}")]
    State(String),

    #[error("plugin has no editor")]
    NoGui,

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundproof_core::SAMPLES_PER_PORT;

    #[test]
    fn test_process_io_borrows() {
        let input = vec![0.25_f32; SAMPLES_PER_PORT];
        let mut output = vec![0.0_f32; SAMPLES_PER_PORT];
        let inputs: [&[f32]; 1] = [&input];
        let mut out_ref: [&mut [f32]; 1] = [&mut output];
        let mut events_out = EventList::new();
        let io = ProcessIo {
            audio_in: &inputs,
            audio_out: &mut out_ref,
            events_in: &[],
            events_out: &mut events_out,
        };
        assert_eq!(io.audio_in.len(), 1);
        assert_eq!(io.audio_out.len(), 1);
    }
}
