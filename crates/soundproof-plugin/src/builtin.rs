//! Built-in adapters.
//!
//! These host no external plugin at all; they exist so the processing
//! fabric can be exercised (and tested) without any plugin files installed.

use crate::{AdapterError, AdapterInfo, PluginAdapter, ProcessIo};
use soundproof_core::RenderMode;
use soundproof_core::events::Event;
use soundproof_core::params::ParamInfo;

/// External id under which [`GainAdapter`] can be instantiated.
pub const BUILTIN_GAIN_ID: &str = "soundproof.gain";

/// Stereo gain. One port in, one port out, one parameter.
///
/// Events pass through unchanged except for `ParamValue` on the gain
/// parameter, which is applied and consumed.
pub struct GainAdapter {
    info: AdapterInfo,
    gain: f64,
    active: bool,
}

impl GainAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: AdapterInfo {
                name: "Gain".to_string(),
                vendor: "soundproof".to_string(),
                version: "1.0.0".to_string(),
                ext_id: BUILTIN_GAIN_ID.to_string(),
                has_gui: false,
                has_params: true,
                audio_in_ports: 1,
                audio_out_ports: 1,
            },
            gain: 1.0,
            active: false,
        }
    }
}

impl Default for GainAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginAdapter for GainAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn activate(&mut self, _sample_rate: f64) -> Result<(), AdapterError> {
        self.active = true;
        Ok(())
    }

    fn deactivate(&mut self) {
        self.active = false;
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> Result<(), AdapterError> {
        for event in io.events_in {
            match *event {
                Event::ParamValue { param: 0, value, .. } => self.gain = value,
                other => {
                    io.events_out.push(other);
                }
            }
        }
        let gain = self.gain as f32;
        for (input, output) in io.audio_in.iter().zip(io.audio_out.iter_mut()) {
            for (i, o) in input.iter().zip(output.iter_mut()) {
                *o = i * gain;
            }
        }
        // Extra output ports get silence.
        for output in io.audio_out.iter_mut().skip(io.audio_in.len()) {
            output.fill(0.0);
        }
        Ok(())
    }

    fn param_infos(&mut self) -> Vec<ParamInfo> {
        vec![ParamInfo::new(0, "Gain", 0.0, 1.0, 1.0)]
    }

    fn param_value(&mut self, index: usize) -> Result<f64, AdapterError> {
        if index == 0 {
            Ok(self.gain)
        } else {
            Err(AdapterError::InvalidParameter(format!("no parameter at index {index}")))
        }
    }

    fn param_value_text(&mut self, index: usize, value: f64) -> Result<String, AdapterError> {
        if index == 0 {
            Ok(format!("{:.2}", value))
        } else {
            Err(AdapterError::InvalidParameter(format!("no parameter at index {index}")))
        }
    }

    fn save_state(&mut self) -> Result<Vec<u8>, AdapterError> {
        Ok(self.gain.to_le_bytes().to_vec())
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| AdapterError::State(format!("expected 8 state bytes, got {}", bytes.len())))?;
        self.gain = f64::from_le_bytes(raw);
        Ok(())
    }

    fn set_render_mode(&mut self, _mode: RenderMode) {}
}
