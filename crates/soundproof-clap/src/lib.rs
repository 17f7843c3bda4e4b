//! CLAP host-side support: bundle loading, plugin enumeration, and the
//! [`PluginAdapter`] implementation for CLAP plugins.
//!
//! Only the subset of the CLAP host contract needed to exchange audio,
//! events, parameter values, and state blobs is implemented; editor
//! embedding and the more exotic extensions stay outside this crate.
//!
//! [`PluginAdapter`]: soundproof_plugin::PluginAdapter

pub mod adapter;
pub mod bundle;
mod convert;

pub use adapter::ClapAdapter;
pub use bundle::{ClapBundle, ClapPluginCaps, ClapPluginMeta};

use std::ffi::CStr;

/// Identifier strings fixed by the CLAP specification. Kept local so this
/// crate does not depend on how `clap-sys` spells its constants.
pub(crate) const PLUGIN_FACTORY_ID: &CStr = c"clap.plugin-factory";
pub(crate) const EXT_AUDIO_PORTS: &CStr = c"clap.audio-ports";
pub(crate) const EXT_GUI: &CStr = c"clap.gui";
pub(crate) const EXT_PARAMS: &CStr = c"clap.params";
pub(crate) const EXT_STATE: &CStr = c"clap.state";

/// CLAP-related errors
#[derive(Debug, thiserror::Error)]
pub enum ClapError {
    #[error("failed to load plugin file {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("{path}: couldn't resolve clap_entry")]
    NoEntry { path: String },

    #[error("{path}: clap_plugin_entry.init failed")]
    EntryInitFailed { path: String },

    #[error("{path}: no plugin factory")]
    NoFactory { path: String },

    #[error("plugin {id:?} not found in {path}")]
    PluginNotFound { path: String, id: String },

    #[error("plugin {id:?}: {reason}")]
    Plugin { id: String, reason: String },
}

/// Read a possibly-unterminated fixed C string buffer.
pub(crate) fn fixed_cstr(buf: &[std::ffi::c_char]) -> String {
    let bytes: Vec<u8> = buf.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Read a nullable NUL-terminated C string pointer.
pub(crate) unsafe fn opt_cstr(ptr: *const std::ffi::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
