//! Dispatch of client messages on the sandbox main thread.

use crate::app::{
    App, DeviceService, LocalConn, RemoteInputConn, SboxDevice, instantiate_adapter,
    main_event_queue,
};
use crate::audio;
use parking_lot::Mutex;
use soundproof_core::events::Event;
use soundproof_core::ids::DeviceId;
use soundproof_core::{MAX_PARAMS, PluginFormat, RenderMode};
use soundproof_ipc::layout::{
    AudioPortsShm, DEVICE_ATOMIC_FLAG_ACTIVE, DEVICE_FLAG_HAS_GUI, DEVICE_FLAG_HAS_PARAMS,
    DeviceShm, ParamInfoShm,
};
use soundproof_ipc::msg::{ClientMsg, SandboxMsg};
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub fn process_messages(app: &Arc<App>) {
    let msgs = match app.poll_messages() {
        Ok(msgs) => msgs,
        Err(err) => {
            // A corrupt stream is unrecoverable; the client will restart us.
            tracing::error!("message stream corrupt: {err}");
            app.send(SandboxMsg::ReportFatalError { text: format!("message stream corrupt: {err}") });
            app.terminate();
            return;
        }
    };
    for msg in msgs {
        dispatch(app, msg);
    }
}

fn dispatch(app: &Arc<App>, msg: ClientMsg) {
    match msg {
        ClientMsg::Activate { sr } => activate(app, sr),
        ClientMsg::CleanShutdown => app.terminate(),
        ClientMsg::CloseAllEditors => close_all_editors(app),
        ClientMsg::Crash => {
            tracing::warn!("crashing on request");
            std::process::abort();
        }
        ClientMsg::Deactivate => deactivate(app),
        ClientMsg::DeviceConnect { out_dev, out_port, out_ports_shmid, in_dev, in_port } => {
            device_connect(app, out_dev, out_port, &out_ports_shmid, in_dev, in_port);
        }
        ClientMsg::DeviceCreate { dev, format, plugfile_path, plugin_ext_id, callback } => {
            device_create(app, dev, format, &plugfile_path, &plugin_ext_id, callback);
        }
        ClientMsg::DeviceDisconnect { out_dev, out_port, in_dev, in_port } => {
            device_disconnect(app, out_dev, out_port, in_dev, in_port);
        }
        ClientMsg::DeviceErase { dev } => device_erase(app, dev),
        ClientMsg::DeviceGuiHide { dev } => device_gui_hide(app, dev),
        ClientMsg::DeviceGuiShow { dev } => device_gui_show(app, dev),
        ClientMsg::DeviceLoad { dev, state, callback } => device_load(app, dev, &state, callback),
        ClientMsg::DeviceSave { dev, callback } => device_save(app, dev, callback),
        ClientMsg::DeviceSetRenderMode { dev, mode } => device_set_render_mode(app, dev, mode),
        ClientMsg::Event { dev, event } => push_event(app, dev, event),
        ClientMsg::GetParamValue { dev, param_idx, callback } => {
            get_param_value(app, dev, param_idx, callback);
        }
        ClientMsg::GetParamValueText { dev, param_idx, value, callback } => {
            get_param_value_text(app, dev, param_idx, value, callback);
        }
        ClientMsg::Heartbeat => app.heartbeat(),
    }
}

fn with_service(app: &App, dev: DeviceId) -> Option<Arc<DeviceService>> {
    app.model.with(|m| m.devices.get(&dev).map(|d| Arc::clone(&d.service)))
}

fn activate(app: &Arc<App>, sr: f64) {
    *app.sample_rate.lock() = sr;
    let services = app.model.with(|m| {
        m.devices.values().map(|d| Arc::clone(&d.service)).collect::<Vec<_>>()
    });
    for service in services {
        if let Err(err) = service.adapter.lock().activate(sr) {
            app.send(SandboxMsg::ReportError { text: format!("activate failed: {err}") });
        }
    }
    if !app.active.swap(true, Ordering::AcqRel) {
        if let Some(snapshots) = app.snapshots.lock().take() {
            *app.worker.lock() = Some(audio::start(app, snapshots));
        }
    }
    app.send(SandboxMsg::ConfirmActivated);
    tracing::info!("activated at {sr} Hz");
}

fn deactivate(app: &Arc<App>) {
    if app.active.swap(false, Ordering::AcqRel) {
        audio::stop(app);
    }
    let services = app.model.with(|m| {
        m.devices.values().map(|d| Arc::clone(&d.service)).collect::<Vec<_>>()
    });
    for service in services {
        service.adapter.lock().deactivate();
    }
    tracing::info!("deactivated");
}

fn close_all_editors(app: &App) {
    let services = app.model.with(|m| {
        m.devices.values().map(|d| (d.id, Arc::clone(&d.service))).collect::<Vec<_>>()
    });
    for (dev, service) in services {
        service.adapter.lock().gui_hide();
        app.send(SandboxMsg::DeviceEditorVisibleChanged { dev, visible: false, native_handle: 0 });
    }
}

fn device_create(
    app: &Arc<App>,
    dev: DeviceId,
    format: PluginFormat,
    plugfile_path: &str,
    plugin_ext_id: &str,
    callback: u64,
) {
    let fail = |app: &App, error: String| {
        tracing::warn!("device {dev} create failed: {error}");
        app.send(SandboxMsg::ReturnCreatedDevice {
            dev,
            dev_shmid: String::new(),
            ports_shmid: String::new(),
            params_shmid: String::new(),
            error,
            callback,
        });
    };

    let mut adapter = match instantiate_adapter(format, plugfile_path, plugin_ext_id) {
        Ok(adapter) => adapter,
        Err(error) => return fail(app, error),
    };
    if let Err(err) = adapter.activate(*app.sample_rate.lock()) {
        return fail(app, err.to_string());
    }
    let info = adapter.info().clone();
    let params = adapter.param_infos();
    if params.len() > MAX_PARAMS {
        return fail(app, format!("plugin exposes {} parameters (limit {MAX_PARAMS})", params.len()));
    }

    let uid = app.next_uid();
    let stem = app.device_shmid(dev, uid);
    let dev_shmid = stem.clone();
    let ports_shmid = format!("{stem}+ports");
    let params_shmid = format!("{stem}+params");

    let shm = match DeviceShm::create(&dev_shmid) {
        Ok(shm) => shm,
        Err(err) => return fail(app, err.to_string()),
    };
    let ports = match AudioPortsShm::create(&ports_shmid, info.audio_in_ports, info.audio_out_ports)
    {
        Ok(ports) => ports,
        Err(err) => return fail(app, err.to_string()),
    };
    let param_seg = match ParamInfoShm::create(&params_shmid, &params) {
        Ok(seg) => seg,
        Err(err) => return fail(app, err.to_string()),
    };

    let mut flags = 0;
    if info.has_gui {
        flags |= DEVICE_FLAG_HAS_GUI;
    }
    if info.has_params {
        flags |= DEVICE_FLAG_HAS_PARAMS;
    }
    shm.data().flags.store(flags, Ordering::Release);
    shm.data().atomic_flags.store(DEVICE_ATOMIC_FLAG_ACTIVE, Ordering::Release);

    let (tx, rx) = main_event_queue();
    let service = Arc::new(DeviceService {
        shm,
        ports,
        params: Mutex::new(param_seg),
        adapter: Mutex::new(adapter),
        events_from_main_tx: Mutex::new(tx),
        events_from_main_rx: Mutex::new(rx),
        uid,
    });
    app.model.modify(|m| {
        m.devices.insert(
            dev,
            SboxDevice { id: dev, format, conns: Vec::new(), input_conns: Vec::new(), service },
        );
        m.insertion.push(dev);
        m.recompute_order();
    });

    tracing::info!("created device {dev} ({})", info.name);
    app.send(SandboxMsg::ReturnCreatedDevice {
        dev,
        dev_shmid,
        ports_shmid,
        params_shmid,
        error: String::new(),
        callback,
    });
}

fn device_connect(
    app: &Arc<App>,
    out_dev: DeviceId,
    out_port: usize,
    out_ports_shmid: &str,
    in_dev: DeviceId,
    in_port: usize,
) {
    let (out_local, in_local) =
        app.model.with(|m| (m.devices.contains_key(&out_dev), m.devices.contains_key(&in_dev)));
    if out_local && in_local {
        app.model.modify(|m| {
            let device = m.devices.get_mut(&out_dev).expect("checked above");
            let conn = LocalConn { this_port: out_port, peer_dev: in_dev, peer_port: in_port };
            if !device.conns.contains(&conn) {
                device.conns.push(conn);
            }
            m.recompute_order();
        });
        return;
    }
    if in_local {
        // Source lives in another sandbox of the group; map its output
        // buffers so the audio worker can pull from them.
        let remote_ports = match AudioPortsShm::open(out_ports_shmid, false) {
            Ok(ports) => Arc::new(ports),
            Err(err) => {
                app.send(SandboxMsg::ReportError {
                    text: format!("connect {out_dev}->{in_dev}: {err}"),
                });
                return;
            }
        };
        app.model.modify(|m| {
            let device = m.devices.get_mut(&in_dev).expect("checked above");
            device.input_conns.retain(|c| {
                !(c.this_port == in_port && c.remote_dev == out_dev && c.remote_port == out_port)
            });
            device.input_conns.push(RemoteInputConn {
                this_port: in_port,
                remote_dev: out_dev,
                remote_port: out_port,
                remote_ports,
            });
        });
    }
    // Only the destination side has work to do for cross-sandbox edges.
}

fn device_disconnect(
    app: &Arc<App>,
    out_dev: DeviceId,
    out_port: usize,
    in_dev: DeviceId,
    in_port: usize,
) {
    app.model.modify(|m| {
        if let Some(device) = m.devices.get_mut(&out_dev) {
            device.conns.retain(|c| {
                !(c.this_port == out_port && c.peer_dev == in_dev && c.peer_port == in_port)
            });
        }
        if let Some(device) = m.devices.get_mut(&in_dev) {
            device.input_conns.retain(|c| {
                !(c.this_port == in_port && c.remote_dev == out_dev && c.remote_port == out_port)
            });
        }
        m.recompute_order();
    });
}

fn device_erase(app: &Arc<App>, dev: DeviceId) {
    app.model.modify(|m| {
        m.devices.remove(&dev);
        m.insertion.retain(|&d| d != dev);
        for device in m.devices.values_mut() {
            device.conns.retain(|c| c.peer_dev != dev);
            device.input_conns.retain(|c| c.remote_dev != dev);
        }
        m.recompute_order();
    });
    tracing::debug!("erased device {dev}");
}

fn device_gui_show(app: &App, dev: DeviceId) {
    let Some(service) = with_service(app, dev) else {
        return;
    };
    match service.adapter.lock().gui_show() {
        Ok(handle) => app.send(SandboxMsg::DeviceEditorVisibleChanged {
            dev,
            visible: true,
            native_handle: handle,
        }),
        Err(err) => app.send(SandboxMsg::ReportWarning { text: format!("device {dev}: {err}") }),
    }
}

fn device_gui_hide(app: &App, dev: DeviceId) {
    let Some(service) = with_service(app, dev) else {
        return;
    };
    service.adapter.lock().gui_hide();
    app.send(SandboxMsg::DeviceEditorVisibleChanged { dev, visible: false, native_handle: 0 });
}

fn device_load(app: &Arc<App>, dev: DeviceId, state: &[u8], callback: u64) {
    let Some(service) = with_service(app, dev) else {
        app.send(SandboxMsg::ReturnLoadResult {
            dev,
            error: format!("no such device {dev}"),
            callback,
        });
        return;
    };
    let result = service.adapter.lock().load_state(state);
    match result {
        Ok(()) => {
            refresh_param_info(app, dev, &service);
            app.send(SandboxMsg::ReturnLoadResult { dev, error: String::new(), callback });
        }
        Err(err) => {
            app.send(SandboxMsg::ReturnLoadResult { dev, error: err.to_string(), callback });
        }
    }
}

/// Rebuild the shared parameter table if a state load changed it. The new
/// table goes into a fresh segment announced over the transport; the old
/// segment stays mapped until the client swaps over.
fn refresh_param_info(app: &App, dev: DeviceId, service: &DeviceService) {
    let infos = service.adapter.lock().param_infos();
    if infos.len() > MAX_PARAMS {
        app.send(SandboxMsg::ReportError {
            text: format!("device {dev} rescan exposes {} parameters", infos.len()),
        });
        return;
    }
    let unchanged = {
        let current = service.params.lock();
        let data = current.data();
        data.count() == infos.len()
            && infos.iter().enumerate().all(|(i, info)| {
                data.get(i).is_some_and(|existing| existing.id == info.id)
            })
    };
    if unchanged {
        return;
    }
    let new_shmid = format!("{}+params", app.device_shmid(dev, app.next_uid()));
    match ParamInfoShm::create(&new_shmid, &infos) {
        Ok(segment) => {
            *service.params.lock() = segment;
            app.send(SandboxMsg::DeviceParamInfoChanged { dev, new_shmid });
        }
        Err(err) => {
            app.send(SandboxMsg::ReportError {
                text: format!("device {dev} param table rebuild failed: {err}"),
            });
        }
    }
}

fn device_save(app: &App, dev: DeviceId, callback: u64) {
    let Some(service) = with_service(app, dev) else {
        app.send(SandboxMsg::ReportError { text: format!("no such device {dev}") });
        app.send(SandboxMsg::ReturnState { bytes: Vec::new(), callback });
        return;
    };
    let result = service.adapter.lock().save_state();
    match result {
        Ok(bytes) => app.send(SandboxMsg::ReturnState { bytes, callback }),
        Err(err) => {
            app.send(SandboxMsg::ReportError { text: format!("device {dev} save: {err}") });
            app.send(SandboxMsg::ReturnState { bytes: Vec::new(), callback });
        }
    }
}

fn device_set_render_mode(app: &App, dev: DeviceId, mode: RenderMode) {
    if let Some(service) = with_service(app, dev) {
        service.adapter.lock().set_render_mode(mode);
    }
}

fn push_event(app: &App, dev: DeviceId, event: Event) {
    let Some(service) = with_service(app, dev) else {
        return;
    };
    // Bounded queue; a stalled audio worker drops surplus events.
    let _ = service.events_from_main_tx.lock().push(event);
}

fn get_param_value(app: &App, dev: DeviceId, param_idx: usize, callback: u64) {
    let Some(service) = with_service(app, dev) else {
        app.send(SandboxMsg::ReturnParamValue { value: f64::NAN, callback });
        return;
    };
    let result = service.adapter.lock().param_value(param_idx);
    match result {
        Ok(value) => app.send(SandboxMsg::ReturnParamValue { value, callback }),
        Err(err) => {
            app.send(SandboxMsg::ReportError { text: format!("device {dev}: {err}") });
            app.send(SandboxMsg::ReturnParamValue { value: f64::NAN, callback });
        }
    }
}

fn get_param_value_text(app: &App, dev: DeviceId, param_idx: usize, value: f64, callback: u64) {
    let Some(service) = with_service(app, dev) else {
        app.send(SandboxMsg::ReturnParamValueText { text: String::new(), callback });
        return;
    };
    let result = service.adapter.lock().param_value_text(param_idx, value);
    match result {
        Ok(text) => app.send(SandboxMsg::ReturnParamValueText { text, callback }),
        Err(err) => {
            app.send(SandboxMsg::ReportError { text: format!("device {dev}: {err}") });
            app.send(SandboxMsg::ReturnParamValueText { text: String::new(), callback });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundproof_ipc::layout::{GroupShm, SandboxShm};
    use soundproof_plugin::builtin::BUILTIN_GAIN_ID;

    // The client-side creator segments must outlive the App opened on them.
    fn test_app(tag: &str) -> (Arc<App>, GroupShm, SandboxShm) {
        let group_shmid = format!("sp-test-msgproc-{tag}-{}-g", std::process::id());
        let sbox_shmid = format!("sp-test-msgproc-{tag}-{}-s", std::process::id());
        let group = GroupShm::create(&group_shmid).unwrap();
        let sbox = SandboxShm::create(&sbox_shmid).unwrap();
        let app = Arc::new(App::new(&group_shmid, &sbox_shmid, 48000.0).unwrap());
        (app, group, sbox)
    }

    #[test]
    fn test_device_create_builtin_and_process_shape() {
        let (app, _group, _sbox) = test_app("create");
        device_create(&app, DeviceId(1), PluginFormat::Unknown, "", BUILTIN_GAIN_ID, 3);
        app.model.with(|m| {
            assert_eq!(m.order, vec![DeviceId(1)]);
            let dev = &m.devices[&DeviceId(1)];
            assert_eq!(dev.service.ports.data().input_count(), 1);
            assert_eq!(dev.service.ports.data().output_count(), 1);
            assert_eq!(dev.service.params.lock().data().count(), 1);
        });
    }

    #[test]
    fn test_device_create_unknown_plugin_reports_error() {
        let (app, _group, _sbox) = test_app("create-bad");
        device_create(&app, DeviceId(1), PluginFormat::Unknown, "", "nope", 3);
        app.model.with(|m| assert!(m.devices.is_empty()));
    }

    #[test]
    fn test_connect_and_erase_update_order() {
        let (app, _group, _sbox) = test_app("conn");
        device_create(&app, DeviceId(1), PluginFormat::Unknown, "", BUILTIN_GAIN_ID, 0);
        device_create(&app, DeviceId(2), PluginFormat::Unknown, "", BUILTIN_GAIN_ID, 1);
        device_connect(&app, DeviceId(2), 0, "", DeviceId(1), 0);
        app.model.with(|m| {
            assert_eq!(m.order, vec![DeviceId(2), DeviceId(1)]);
        });
        device_erase(&app, DeviceId(2));
        app.model.with(|m| {
            assert_eq!(m.order, vec![DeviceId(1)]);
            assert!(m.devices[&DeviceId(1)].input_conns.is_empty());
        });
    }
}
