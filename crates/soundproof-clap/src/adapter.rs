//! [`PluginAdapter`] implementation for CLAP plugins.

use crate::bundle::{ClapBundle, make_host};
use crate::convert::{
    ClapEventAny, InEventStore, OutEventSink, ReadCursor, input_events, istream, ostream,
    output_events, to_clap,
};
use crate::{ClapError, EXT_AUDIO_PORTS, EXT_GUI, EXT_PARAMS, EXT_STATE, bundle, fixed_cstr};
use clap_sys::audio_buffer::clap_audio_buffer;
use clap_sys::ext::audio_ports::clap_plugin_audio_ports;
use clap_sys::ext::params::{clap_param_info, clap_plugin_params};
use clap_sys::ext::state::clap_plugin_state;
use clap_sys::host::clap_host;
use clap_sys::plugin::clap_plugin;
use clap_sys::process::clap_process;
use soundproof_core::params::ParamInfo;
use soundproof_core::{MAX_AUDIO_PORTS, RenderMode, VECTOR_SIZE};
use soundproof_plugin::{AdapterError, AdapterInfo, PluginAdapter, ProcessIo};
use std::ffi::c_char;
use std::path::Path;
use std::sync::Arc;

/// Host-side CLAP plugin instance.
pub struct ClapAdapter {
    /// Keeps the dynamic library (and entry) alive for as long as the
    /// plugin instance exists.
    _bundle: Arc<ClapBundle>,
    /// Boxed so the address handed to `create_plugin` stays stable.
    _host: Box<clap_host>,
    plugin: *const clap_plugin,
    info: AdapterInfo,
    /// Plugin-native id per table index, refreshed with the param table.
    param_ids: Vec<u32>,
    in_store: InEventStore,
    active: bool,
    processing: bool,
}

// The sandbox serializes access through a mutex; main-thread calls happen on
// the sandbox main thread and `process` on its audio worker, matching the
// CLAP thread contract.
unsafe impl Send for ClapAdapter {}

impl ClapAdapter {
    /// Instantiate and init `plugin_id` from `plugfile_path`.
    pub fn create(plugfile_path: &str, plugin_id: &str) -> Result<Self, ClapError> {
        let bundle = Arc::new(ClapBundle::load(Path::new(plugfile_path))?);
        let meta = bundle
            .descriptors()?
            .into_iter()
            .find(|meta| meta.id == plugin_id)
            .ok_or_else(|| ClapError::PluginNotFound {
                path: plugfile_path.to_string(),
                id: plugin_id.to_string(),
            })?;
        let host = Box::new(make_host());
        let plugin = unsafe { bundle.create_plugin(&raw const *host, plugin_id)? };
        let init_ok = unsafe { (*plugin).init.is_some_and(|init| init(plugin)) };
        if !init_ok {
            unsafe {
                if let Some(destroy) = (*plugin).destroy {
                    destroy(plugin);
                }
            }
            return Err(ClapError::Plugin {
                id: plugin_id.to_string(),
                reason: "clap_plugin.init failed".to_string(),
            });
        }

        let mut adapter = Self {
            _bundle: bundle,
            _host: host,
            plugin,
            info: AdapterInfo {
                name: meta.name,
                vendor: meta.vendor,
                version: meta.version,
                ext_id: meta.id,
                has_gui: false,
                has_params: false,
                audio_in_ports: 1,
                audio_out_ports: 1,
            },
            param_ids: Vec::new(),
            in_store: InEventStore { events: Vec::new() },
            active: false,
            processing: false,
        };
        adapter.info.has_gui = unsafe { bundle::get_extension(plugin, EXT_GUI).is_some() };
        adapter.info.has_params = adapter.params_ext().is_some();
        let (inputs, outputs) = adapter.audio_port_counts();
        adapter.info.audio_in_ports = inputs;
        adapter.info.audio_out_ports = outputs;
        adapter.refresh_param_ids();
        Ok(adapter)
    }

    fn params_ext(&self) -> Option<&clap_plugin_params> {
        unsafe {
            bundle::get_extension(self.plugin, EXT_PARAMS)
                .map(|ext| &*ext.cast::<clap_plugin_params>())
        }
    }

    fn state_ext(&self) -> Option<&clap_plugin_state> {
        unsafe {
            bundle::get_extension(self.plugin, EXT_STATE)
                .map(|ext| &*ext.cast::<clap_plugin_state>())
        }
    }

    fn audio_port_counts(&self) -> (usize, usize) {
        unsafe {
            let Some(ext) = bundle::get_extension(self.plugin, EXT_AUDIO_PORTS) else {
                return (1, 1);
            };
            let ports = &*ext.cast::<clap_plugin_audio_ports>();
            let Some(count) = ports.count else {
                return (1, 1);
            };
            let inputs = (count(self.plugin, true) as usize).min(MAX_AUDIO_PORTS);
            let outputs = (count(self.plugin, false) as usize).min(MAX_AUDIO_PORTS);
            (inputs, outputs)
        }
    }

    fn raw_param_info(&self, index: u32) -> Option<clap_param_info> {
        let params = self.params_ext()?;
        let get_info = params.get_info?;
        let mut info = std::mem::MaybeUninit::<clap_param_info>::zeroed();
        let ok = unsafe { get_info(self.plugin, index, info.as_mut_ptr()) };
        ok.then(|| unsafe { info.assume_init() })
    }

    fn refresh_param_ids(&mut self) {
        self.param_ids.clear();
        let count = self
            .params_ext()
            .and_then(|params| params.count)
            .map_or(0, |count| unsafe { count(self.plugin) });
        for index in 0..count {
            if let Some(info) = self.raw_param_info(index) {
                self.param_ids.push(info.id);
            }
        }
    }

    fn param_id_at(&self, index: usize) -> Result<u32, AdapterError> {
        self.param_ids.get(index).copied().ok_or_else(|| {
            AdapterError::InvalidParameter(format!("no parameter at index {index}"))
        })
    }
}

impl PluginAdapter for ClapAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn activate(&mut self, sample_rate: f64) -> Result<(), AdapterError> {
        if self.active {
            return Ok(());
        }
        let frames = VECTOR_SIZE as u32;
        let ok = unsafe {
            (*self.plugin)
                .activate
                .is_some_and(|activate| activate(self.plugin, sample_rate, frames, frames))
        };
        if !ok {
            return Err(AdapterError::ActivationFailed(format!(
                "clap_plugin.activate({sample_rate}) failed for {}",
                self.info.ext_id
            )));
        }
        self.active = true;
        Ok(())
    }

    fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        unsafe {
            if self.processing {
                if let Some(stop) = (*self.plugin).stop_processing {
                    stop(self.plugin);
                }
                self.processing = false;
            }
            if let Some(deactivate) = (*self.plugin).deactivate {
                deactivate(self.plugin);
            }
        }
        self.active = false;
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> Result<(), AdapterError> {
        if !self.active {
            return Err(AdapterError::ProcessingFailed("plugin not active".to_string()));
        }
        unsafe {
            if !self.processing {
                let ok = (*self.plugin)
                    .start_processing
                    .is_none_or(|start| start(self.plugin));
                if !ok {
                    return Err(AdapterError::ProcessingFailed(
                        "clap_plugin.start_processing failed".to_string(),
                    ));
                }
                self.processing = true;
            }
        }

        // Convert incoming events, mapping table indices to plugin ids.
        let param_ids = &self.param_ids;
        let in_store = &mut self.in_store;
        in_store.events.clear();
        for event in io.events_in {
            let converted: Option<ClapEventAny> =
                to_clap(event, |index| param_ids.get(index as usize).copied());
            if let Some(converted) = converted {
                in_store.events.push(converted);
            }
        }
        let in_list = input_events(&self.in_store);

        let param_ids = &self.param_ids;
        let param_index_for_id =
            |id: u32| param_ids.iter().position(|&p| p == id).map(|i| i as u32);
        let mut out_sink =
            OutEventSink { list: &mut *io.events_out, param_index_for_id: &param_index_for_id };
        let out_list = output_events(&mut out_sink);

        // Channel pointer tables. Each port block is channel-major, so the
        // per-channel pointers are VECTOR_SIZE floats apart.
        let mut in_channel_ptrs: Vec<[*mut f32; 2]> = io
            .audio_in
            .iter()
            .map(|port| {
                let base = port.as_ptr().cast_mut();
                [base, unsafe { base.add(VECTOR_SIZE) }]
            })
            .collect();
        let mut out_channel_ptrs: Vec<[*mut f32; 2]> = io
            .audio_out
            .iter_mut()
            .map(|port| {
                let base = port.as_mut_ptr();
                [base, unsafe { base.add(VECTOR_SIZE) }]
            })
            .collect();
        let in_buffers: Vec<clap_audio_buffer> = in_channel_ptrs
            .iter_mut()
            .map(|channels| clap_audio_buffer {
                data32: channels.as_mut_ptr().cast(),
                data64: std::ptr::null_mut(),
                channel_count: 2,
                latency: 0,
                constant_mask: 0,
            })
            .collect();
        let mut out_buffers: Vec<clap_audio_buffer> = out_channel_ptrs
            .iter_mut()
            .map(|channels| clap_audio_buffer {
                data32: channels.as_mut_ptr().cast(),
                data64: std::ptr::null_mut(),
                channel_count: 2,
                latency: 0,
                constant_mask: 0,
            })
            .collect();

        let process = clap_process {
            steady_time: -1,
            frames_count: VECTOR_SIZE as u32,
            transport: std::ptr::null(),
            audio_inputs: in_buffers.as_ptr(),
            audio_outputs: out_buffers.as_mut_ptr(),
            audio_inputs_count: in_buffers.len() as u32,
            audio_outputs_count: out_buffers.len() as u32,
            in_events: &raw const in_list,
            out_events: &raw const out_list,
        };

        unsafe {
            let Some(process_fn) = (*self.plugin).process else {
                return Err(AdapterError::ProcessingFailed("plugin has no process".to_string()));
            };
            process_fn(self.plugin, &raw const process);
        }
        Ok(())
    }

    fn param_infos(&mut self) -> Vec<ParamInfo> {
        self.refresh_param_ids();
        let mut infos = Vec::with_capacity(self.param_ids.len());
        for index in 0..self.param_ids.len() as u32 {
            if let Some(raw) = self.raw_param_info(index) {
                infos.push(ParamInfo::new(
                    raw.id,
                    &fixed_cstr(&raw.name),
                    raw.min_value,
                    raw.max_value,
                    raw.default_value,
                ));
            }
        }
        infos
    }

    fn param_value(&mut self, index: usize) -> Result<f64, AdapterError> {
        let id = self.param_id_at(index)?;
        let params = self
            .params_ext()
            .ok_or_else(|| AdapterError::Unsupported("plugin has no params".to_string()))?;
        let get_value = params
            .get_value
            .ok_or_else(|| AdapterError::Unsupported("plugin has no get_value".to_string()))?;
        let mut value = 0.0_f64;
        let ok = unsafe { get_value(self.plugin, id, &raw mut value) };
        if ok {
            Ok(value)
        } else {
            Err(AdapterError::InvalidParameter(format!("get_value failed for param {id}")))
        }
    }

    fn param_value_text(&mut self, index: usize, value: f64) -> Result<String, AdapterError> {
        let id = self.param_id_at(index)?;
        let params = self
            .params_ext()
            .ok_or_else(|| AdapterError::Unsupported("plugin has no params".to_string()))?;
        let value_to_text = params
            .value_to_text
            .ok_or_else(|| AdapterError::Unsupported("plugin has no value_to_text".to_string()))?;
        let mut buf = [0 as c_char; 256];
        let ok = unsafe {
            value_to_text(self.plugin, id, value, buf.as_mut_ptr(), buf.len() as u32)
        };
        if ok {
            Ok(fixed_cstr(&buf))
        } else {
            Err(AdapterError::InvalidParameter(format!("value_to_text failed for param {id}")))
        }
    }

    fn save_state(&mut self) -> Result<Vec<u8>, AdapterError> {
        let state = self
            .state_ext()
            .ok_or_else(|| AdapterError::Unsupported("plugin has no state extension".to_string()))?;
        let save = state
            .save
            .ok_or_else(|| AdapterError::Unsupported("plugin has no state.save".to_string()))?;
        let mut bytes = Vec::new();
        let stream = ostream(&mut bytes);
        let ok = unsafe { save(self.plugin, &raw const stream) };
        if ok {
            Ok(bytes)
        } else {
            Err(AdapterError::State("clap_plugin_state.save failed".to_string()))
        }
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        let state = self
            .state_ext()
            .ok_or_else(|| AdapterError::Unsupported("plugin has no state extension".to_string()))?;
        let load = state
            .load
            .ok_or_else(|| AdapterError::Unsupported("plugin has no state.load".to_string()))?;
        let mut cursor = ReadCursor { bytes, pos: 0 };
        let stream = istream(&mut cursor);
        let ok = unsafe { load(self.plugin, &raw const stream) };
        if ok {
            Ok(())
        } else {
            Err(AdapterError::State("clap_plugin_state.load failed".to_string()))
        }
    }

    fn set_render_mode(&mut self, _mode: RenderMode) {
        // The render extension is not wired up; realtime-safe behavior is
        // the default for every plugin.
    }

    fn gui_show(&mut self) -> Result<i64, AdapterError> {
        // Editor embedding lives outside this crate.
        Err(AdapterError::Unsupported("editor embedding not supported".to_string()))
    }
}

impl Drop for ClapAdapter {
    fn drop(&mut self) {
        self.deactivate();
        unsafe {
            if let Some(destroy) = (*self.plugin).destroy {
                destroy(self.plugin);
            }
        }
    }
}

/// Sanity checks for the event plumbing that don't need a real plugin.
#[cfg(test)]
mod tests {
    use super::*;
    use soundproof_core::events::Event;

    #[test]
    fn test_create_missing_file_fails() {
        assert!(ClapAdapter::create("/nonexistent/verb.clap", "some.plugin").is_err());
    }

    #[test]
    fn test_event_index_mapping_uses_param_table() {
        // `to_clap` consults the table the adapter would provide.
        let table = [100_u32, 200, 300];
        let ev = Event::ParamValue { time: 0, param: 1, value: 0.5 };
        let converted = to_clap(&ev, |index| table.get(index as usize).copied()).unwrap();
        unsafe {
            assert_eq!(converted.param.param_id, 200);
        }
    }
}
