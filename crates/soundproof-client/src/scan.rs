//! Client side of the plugin scanner: spawns the scanner child, reads its
//! stdout/stderr line by line on background threads, folds records into
//! the model, and emits reporter events.

use crate::instance::{Inner, enqueue_device_create, late_create_callback};
use crate::model::{Plugfile, Plugin};
use crate::report::GeneralReport;
use soundproof_core::ids::{DeviceId, PlugfileId, PluginId};
use soundproof_core::PluginFormat;
use soundproof_scan::ScanRecord;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

/// Options for a scan run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanFlags {
    /// Re-create devices stuck in plugin-unknown error state when a scan
    /// finds their plugin.
    pub reload_failed_devices: bool,
}

#[derive(Default)]
pub(crate) struct ScanState {
    thread: Option<JoinHandle<()>>,
    child: Option<Arc<parking_lot::Mutex<Option<Child>>>>,
}

/// Start (or restart) a scan.
pub(crate) fn start_scan(inner: &Arc<Inner>, scanner_exe: &Path, flags: ScanFlags) {
    stop_scan(inner);

    if !scanner_exe.is_file() {
        inner.report_general(GeneralReport::ScanError {
            error: format!("scanner executable not found: {}", scanner_exe.display()),
        });
        return;
    }

    let spawned = Command::new(scanner_exe)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            inner.report_general(GeneralReport::ScanError {
                error: format!("failed to spawn scanner: {err}"),
            });
            return;
        }
    };

    inner.scanning.store(true, Ordering::Release);
    inner.report_general(GeneralReport::ScanStarted);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let child = Arc::new(parking_lot::Mutex::new(Some(child)));

    let driver = {
        let inner = Arc::clone(inner);
        let child = Arc::clone(&child);
        std::thread::Builder::new()
            .name("sp-scan".to_string())
            .spawn(move || {
                // Broken records arrive on stderr; read it concurrently so
                // neither pipe can fill up and stall the child.
                let stderr_reader = stderr.map(|stderr| {
                    let inner = Arc::clone(&inner);
                    std::thread::spawn(move || {
                        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                            parse_line(&inner, &line, flags);
                        }
                    })
                });
                if let Some(stdout) = stdout {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        parse_line(&inner, &line, flags);
                    }
                }
                if let Some(handle) = stderr_reader {
                    let _ = handle.join();
                }
                let status = child.lock().take().map(|mut c| c.wait());
                match status {
                    Some(Ok(status)) if status.success() => {}
                    Some(Ok(status)) => inner.report_general(GeneralReport::ScanWarning {
                        warning: format!("scanner exited abnormally: {status}"),
                    }),
                    Some(Err(err)) => inner.report_general(GeneralReport::ScanError {
                        error: format!("failed to wait for scanner: {err}"),
                    }),
                    None => {}
                }
                inner.scanning.store(false, Ordering::Release);
                inner.report_general(GeneralReport::ScanComplete);
            })
            .expect("spawn scan thread")
    };

    let mut state = inner.scan.lock();
    state.thread = Some(driver);
    state.child = Some(child);
}

/// Kill any running scan and join its driver.
pub(crate) fn stop_scan(inner: &Arc<Inner>) {
    let (thread, child) = {
        let mut state = inner.scan.lock();
        (state.thread.take(), state.child.take())
    };
    if let Some(child) = child {
        if let Some(mut child) = child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
    if let Some(thread) = thread {
        let _ = thread.join();
    }
    inner.scanning.store(false, Ordering::Release);
}

fn parse_line(inner: &Arc<Inner>, line: &str, flags: ScanFlags) {
    if line.is_empty() {
        return;
    }
    match ScanRecord::parse(line) {
        Ok(record) => handle_record(inner, record, flags),
        Err(err) => inner.report_general(GeneralReport::ScanWarning {
            warning: format!("malformed scanner output: {err}"),
        }),
    }
}

/// Fold one scanner record into the model and emit the matching report.
pub(crate) fn handle_record(inner: &Arc<Inner>, record: ScanRecord, flags: ScanFlags) {
    match record {
        ScanRecord::Plugfile { plugfile_type, path } => {
            let id = upsert_plugfile(inner, &plugfile_type, &path, "");
            inner.report_general(GeneralReport::PlugfileScanned { plugfile: id });
        }
        ScanRecord::BrokenPlugfile { plugfile_type, path, error } => {
            let id = upsert_plugfile(inner, &plugfile_type, &path, &error);
            inner.report_general(GeneralReport::PlugfileBroken { plugfile: id });
        }
        ScanRecord::Plugin {
            plugfile_type,
            path,
            name,
            id,
            vendor,
            version,
            url: _,
            features,
            has_gui: _,
            has_params: _,
        } => {
            let plugin_id = upsert_plugin(
                inner,
                &plugfile_type,
                &path,
                Plugin {
                    id: PluginId::INVALID,
                    plugfile: PlugfileId::INVALID,
                    ext_id: id,
                    format: PluginFormat::from_name(&plugfile_type),
                    error: String::new(),
                    name,
                    vendor,
                    version,
                    features,
                },
            );
            inner.report_general(GeneralReport::PluginScanned { plugin: plugin_id });
            if flags.reload_failed_devices {
                revive_failed_devices(inner, plugin_id);
            }
        }
        ScanRecord::BrokenPlugin { plugfile_type, path, name, id, vendor, version, error } => {
            let plugin_id = upsert_plugin(
                inner,
                &plugfile_type,
                &path,
                Plugin {
                    id: PluginId::INVALID,
                    plugfile: PlugfileId::INVALID,
                    ext_id: id,
                    format: PluginFormat::from_name(&plugfile_type),
                    error,
                    name,
                    vendor,
                    version,
                    features: Vec::new(),
                },
            );
            inner.report_general(GeneralReport::PluginBroken { plugin: plugin_id });
        }
    }
}

fn upsert_plugfile(inner: &Arc<Inner>, format_name: &str, path: &str, error: &str) -> PlugfileId {
    inner.model.modify(|m| {
        if let Some(existing) = m.find_plugfile_by_path(path) {
            let id = existing.id;
            if let Some(entry) = m.plugfiles.get_mut(&id) {
                error.clone_into(&mut entry.error);
            }
            return id;
        }
        let id = PlugfileId(inner.ids.next());
        m.plugfiles.insert(
            id,
            Plugfile {
                id,
                format: PluginFormat::from_name(format_name),
                path: path.to_string(),
                error: error.to_string(),
            },
        );
        id
    })
}

fn upsert_plugin(
    inner: &Arc<Inner>,
    format_name: &str,
    path: &str,
    mut plugin: Plugin,
) -> PluginId {
    inner.model.modify(|m| {
        let plugfile = match m.find_plugfile_by_path(path) {
            Some(pf) => pf.id,
            None => {
                // Single-file scans may never emit the plugfile record.
                let id = PlugfileId(inner.ids.next());
                m.plugfiles.insert(
                    id,
                    Plugfile {
                        id,
                        format: PluginFormat::from_name(format_name),
                        path: path.to_string(),
                        error: String::new(),
                    },
                );
                id
            }
        };
        if let Some(existing) =
            m.plugins.values().find(|p| p.ext_id == plugin.ext_id && p.format == plugin.format)
        {
            let id = existing.id;
            plugin.id = id;
            plugin.plugfile = plugfile;
            m.plugins.insert(id, plugin);
            return id;
        }
        let id = PluginId(inner.ids.next());
        plugin.id = id;
        plugin.plugfile = plugfile;
        m.plugins.insert(id, plugin);
        id
    })
}

/// Re-create devices that were created against this plugin's external id
/// before it was known. Each revival ends in a `device_late_create` report.
fn revive_failed_devices(inner: &Arc<Inner>, plugin_id: PluginId) {
    let mut failed: Vec<(DeviceId, crate::service::ReturnDevice)> = Vec::new();
    inner.model.modify(|m| {
        let Some(plugin) = m.plugins.get(&plugin_id) else {
            return;
        };
        if !plugin.error.is_empty() {
            return;
        }
        let ext_id = plugin.ext_id.clone();
        let format = plugin.format;
        let stuck: Vec<DeviceId> = m
            .devices
            .values()
            .filter(|d| {
                d.service.is_none()
                    && !d.error.is_empty()
                    && d.plugin_ext_id == ext_id
                    && (d.format == format || d.format == PluginFormat::Unknown)
            })
            .map(|d| d.id)
            .collect();
        for dev in stuck {
            let (sbox, name) = {
                let device = m.devices.get_mut(&dev).expect("listed above");
                device.plugin = plugin_id;
                device.format = format;
                device.error.clear();
                (device.sbox, device.name.clone())
            };
            if name.is_empty() {
                if let Some(plugin) = m.plugins.get(&plugin_id) {
                    let plugin_name = plugin.name.clone();
                    if let Some(device) = m.devices.get_mut(&dev) {
                        device.name = plugin_name;
                    }
                }
            }
            tracing::info!("reviving device {dev} with freshly scanned plugin");
            if let Err(cb) = enqueue_device_create(m, dev, late_create_callback(inner, sbox)) {
                failed.push((dev, cb));
            }
        }
    });
    // Continuations run outside the model lock.
    for (dev, cb) in failed {
        cb(dev, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;

    fn records_model(instance: &Instance) -> (usize, usize) {
        let mut plugins = 0;
        let mut plugfiles = 0;
        instance.receive_reports(|r| match r {
            GeneralReport::PluginScanned { .. } | GeneralReport::PluginBroken { .. } => {
                plugins += 1;
            }
            GeneralReport::PlugfileScanned { .. } | GeneralReport::PlugfileBroken { .. } => {
                plugfiles += 1;
            }
            _ => {}
        });
        (plugins, plugfiles)
    }

    #[test]
    fn test_records_update_model_and_reports() {
        let instance = Instance::init().unwrap();
        let inner = instance.test_inner();
        handle_record(
            &inner,
            ScanRecord::Plugfile {
                plugfile_type: "clap".to_string(),
                path: "/p/verb.clap".to_string(),
            },
            ScanFlags::default(),
        );
        handle_record(
            &inner,
            ScanRecord::Plugin {
                plugfile_type: "clap".to_string(),
                path: "/p/verb.clap".to_string(),
                name: "MaGigaverb".to_string(),
                id: "studio.kx.distrho.MaGigaverb".to_string(),
                vendor: "DISTRHO".to_string(),
                version: "1.0".to_string(),
                url: String::new(),
                features: vec!["audio-effect".to_string()],
                has_gui: true,
                has_params: true,
            },
            ScanFlags::default(),
        );
        let found = instance.find_plugin("studio.kx.distrho.MaGigaverb", PluginFormat::Clap);
        assert!(found.is_some());
        assert!(instance.has_rack_features(found.unwrap()));
        let (plugins, plugfiles) = records_model(&instance);
        assert_eq!((plugins, plugfiles), (1, 1));
        instance.shutdown();
    }

    #[test]
    fn test_broken_plugin_lands_in_broken_list() {
        let instance = Instance::init().unwrap();
        let inner = instance.test_inner();
        handle_record(
            &inner,
            ScanRecord::BrokenPlugin {
                plugfile_type: "clap".to_string(),
                path: "/p/bad.clap".to_string(),
                name: String::new(),
                id: "bad.plugin".to_string(),
                vendor: String::new(),
                version: String::new(),
                error: "init aborted".to_string(),
            },
            ScanFlags::default(),
        );
        assert_eq!(instance.broken_plugins().len(), 1);
        assert_eq!(instance.working_plugins().len(), 0);
        instance.shutdown();
    }

    #[test]
    fn test_rescan_updates_in_place() {
        let instance = Instance::init().unwrap();
        let inner = instance.test_inner();
        let plugfile = ScanRecord::Plugfile {
            plugfile_type: "clap".to_string(),
            path: "/p/verb.clap".to_string(),
        };
        handle_record(&inner, plugfile.clone(), ScanFlags::default());
        handle_record(&inner, plugfile, ScanFlags::default());
        inner.model.with(|m| assert_eq!(m.plugfiles.len(), 1));
        instance.shutdown();
    }
}
