//! Loading CLAP plugin files and enumerating their factories.

use crate::{ClapError, PLUGIN_FACTORY_ID, opt_cstr};
use clap_sys::entry::clap_plugin_entry;
use clap_sys::host::clap_host;
use clap_sys::plugin::clap_plugin;
use clap_sys::factory::plugin_factory::clap_plugin_factory;
use clap_sys::version::CLAP_VERSION;
use libloading::Library;
use std::ffi::{CString, c_char, c_void};
use std::path::{Path, PathBuf};

const ENTRY_SYMBOL: &[u8] = b"clap_entry\0";

/// Metadata for one factory entry.
#[derive(Debug, Clone, Default)]
pub struct ClapPluginMeta {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub url: String,
    pub features: Vec<String>,
}

/// Capabilities discovered by instantiating a plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClapPluginCaps {
    pub has_gui: bool,
    pub has_params: bool,
}

/// On macOS a `.clap` is a bundle directory; the loadable binary sits at
/// `Contents/MacOS/<stem>`. Everywhere else the `.clap` file is the binary.
fn binary_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        let stem = path.file_stem().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
        path.join("Contents").join("MacOS").join(stem)
    } else {
        path.to_path_buf()
    }
}

/// A loaded `.clap` file with an initialized entry point.
pub struct ClapBundle {
    _library: Library,
    entry: *const clap_plugin_entry,
    path: String,
}

// The CLAP spec requires entries and factories to be thread-safe.
unsafe impl Send for ClapBundle {}
unsafe impl Sync for ClapBundle {}

impl ClapBundle {
    pub fn load(path: &Path) -> Result<Self, ClapError> {
        let path_display = path.display().to_string();
        let library = unsafe { Library::new(binary_path(path)) }.map_err(|e| {
            ClapError::Load { path: path_display.clone(), reason: e.to_string() }
        })?;
        let entry: *const clap_plugin_entry = unsafe {
            match library.get::<*const clap_plugin_entry>(ENTRY_SYMBOL) {
                Ok(symbol) => *symbol,
                Err(_) => return Err(ClapError::NoEntry { path: path_display }),
            }
        };
        if entry.is_null() {
            return Err(ClapError::NoEntry { path: path_display });
        }
        let c_path = CString::new(path_display.clone())
            .map_err(|_| ClapError::NoEntry { path: path_display.clone() })?;
        let init = unsafe { (*entry).init };
        let ok = init.is_none_or(|init| unsafe { init(c_path.as_ptr()) });
        if !ok {
            return Err(ClapError::EntryInitFailed { path: path_display });
        }
        tracing::debug!("loaded clap bundle {path_display}");
        Ok(Self { _library: library, entry, path: path_display })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn factory(&self) -> Result<*const clap_plugin_factory, ClapError> {
        let get_factory = unsafe { (*self.entry).get_factory }
            .ok_or_else(|| ClapError::NoFactory { path: self.path.clone() })?;
        let factory =
            unsafe { get_factory(PLUGIN_FACTORY_ID.as_ptr()) }.cast::<clap_plugin_factory>();
        if factory.is_null() {
            return Err(ClapError::NoFactory { path: self.path.clone() });
        }
        Ok(factory)
    }

    /// Descriptors of every factory entry in this file.
    pub fn descriptors(&self) -> Result<Vec<ClapPluginMeta>, ClapError> {
        let factory = self.factory()?;
        let mut metas = Vec::new();
        unsafe {
            let count = (*factory).get_plugin_count.map_or(0, |f| f(factory));
            for index in 0..count {
                let Some(get_descriptor) = (*factory).get_plugin_descriptor else {
                    break;
                };
                let desc = get_descriptor(factory, index);
                if desc.is_null() {
                    continue;
                }
                let desc = &*desc;
                let mut features = Vec::new();
                let mut feature = desc.features;
                while !feature.is_null() && !(*feature).is_null() {
                    features.push(opt_cstr(*feature));
                    feature = feature.add(1);
                }
                metas.push(ClapPluginMeta {
                    id: opt_cstr(desc.id),
                    name: opt_cstr(desc.name),
                    vendor: opt_cstr(desc.vendor),
                    version: opt_cstr(desc.version),
                    url: opt_cstr(desc.url),
                    features,
                });
            }
        }
        Ok(metas)
    }

    /// Instantiate a plugin from this bundle against `host`. Does not call
    /// `init`; the caller decides how to drive the instance.
    ///
    /// # Safety
    ///
    /// `host` must stay valid for the lifetime of the returned plugin.
    pub unsafe fn create_plugin(
        &self,
        host: *const clap_host,
        plugin_id: &str,
    ) -> Result<*const clap_plugin, ClapError> {
        let factory = self.factory()?;
        let c_id = CString::new(plugin_id).map_err(|_| ClapError::PluginNotFound {
            path: self.path.clone(),
            id: plugin_id.to_string(),
        })?;
        let create = unsafe { (*factory).create_plugin }.ok_or_else(|| {
            ClapError::PluginNotFound { path: self.path.clone(), id: plugin_id.to_string() }
        })?;
        let plugin = unsafe { create(factory, host, c_id.as_ptr()) };
        if plugin.is_null() {
            return Err(ClapError::PluginNotFound {
                path: self.path.clone(),
                id: plugin_id.to_string(),
            });
        }
        Ok(plugin)
    }

    /// Instantiate, init, and activate one plugin just to learn its
    /// capabilities, then tear it down again. Used by the scanner.
    pub fn probe(&self, plugin_id: &str) -> Result<ClapPluginCaps, ClapError> {
        let host = Box::new(make_host());
        let plugin = unsafe { self.create_plugin(&raw const *host, plugin_id)? };
        unsafe {
            let plugin_ref = &*plugin;
            if !plugin_ref.init.is_some_and(|init| init(plugin)) {
                if let Some(destroy) = plugin_ref.destroy {
                    destroy(plugin);
                }
                return Err(ClapError::Plugin {
                    id: plugin_id.to_string(),
                    reason: "clap_plugin.init failed".to_string(),
                });
            }
            if !plugin_ref.activate.is_some_and(|activate| activate(plugin, 48000.0, 32, 4096)) {
                if let Some(destroy) = plugin_ref.destroy {
                    destroy(plugin);
                }
                return Err(ClapError::Plugin {
                    id: plugin_id.to_string(),
                    reason: "clap_plugin.activate failed".to_string(),
                });
            }
            let caps = ClapPluginCaps {
                has_gui: get_extension(plugin, crate::EXT_GUI).is_some(),
                has_params: get_extension(plugin, crate::EXT_PARAMS).is_some(),
            };
            if let Some(deactivate) = plugin_ref.deactivate {
                deactivate(plugin);
            }
            if let Some(destroy) = plugin_ref.destroy {
                destroy(plugin);
            }
            Ok(caps)
        }
    }
}

impl Drop for ClapBundle {
    fn drop(&mut self) {
        unsafe {
            if let Some(deinit) = (*self.entry).deinit {
                deinit();
            }
        }
    }
}

/// Query a plugin extension pointer.
pub(crate) unsafe fn get_extension(
    plugin: *const clap_plugin,
    id: &std::ffi::CStr,
) -> Option<*const c_void> {
    let get = unsafe { (*plugin).get_extension }?;
    let ext = unsafe { get(plugin, id.as_ptr()) };
    (!ext.is_null()).then_some(ext)
}

const HOST_NAME: &std::ffi::CStr = c"soundproof";
const HOST_VENDOR: &std::ffi::CStr = c"soundproof";
const HOST_URL: &std::ffi::CStr = c"https://github.com/yourusername/soundproof";
const HOST_VERSION: &std::ffi::CStr = c"0.1.0";

unsafe extern "C" fn host_get_extension(_host: *const clap_host, _id: *const c_char) -> *const c_void {
    std::ptr::null()
}

unsafe extern "C" fn host_request_restart(_host: *const clap_host) {}
unsafe extern "C" fn host_request_process(_host: *const clap_host) {}
unsafe extern "C" fn host_request_callback(_host: *const clap_host) {}

/// A host vtable that accepts everything and provides nothing.
pub(crate) fn make_host() -> clap_host {
    clap_host {
        clap_version: CLAP_VERSION,
        host_data: std::ptr::null_mut(),
        name: HOST_NAME.as_ptr(),
        vendor: HOST_VENDOR.as_ptr(),
        url: HOST_URL.as_ptr(),
        version: HOST_VERSION.as_ptr(),
        get_extension: Some(host_get_extension),
        request_restart: Some(host_request_restart),
        request_process: Some(host_request_process),
        request_callback: Some(host_request_callback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_path_plain_file() {
        let path = Path::new("/plugins/verb.clap");
        assert_eq!(binary_path(path), PathBuf::from("/plugins/verb.clap"));
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        assert!(ClapBundle::load(Path::new("/nonexistent/nope.clap")).is_err());
    }
}
