//! The sandbox process: hosts plugin adapters, pumps the shared-memory
//! message transport on its main thread, and runs one audio worker that
//! participates in the group processing protocol.

pub mod app;
pub mod audio;
pub mod graph;
pub mod msgproc;

#[cfg(test)]
mod tests {
    use crate::app::{App, instantiate_adapter};
    use crate::audio::process_buffer;
    use crate::msgproc;
    use soundproof_core::events::Event;
    use soundproof_core::ids::DeviceId;
    use soundproof_core::{PluginFormat, SAMPLES_PER_PORT};
    use soundproof_ipc::layout::{GroupShm, SandboxShm};
    use soundproof_plugin::builtin::BUILTIN_GAIN_ID;
    use std::sync::Arc;

    fn test_app(tag: &str) -> (Arc<App>, GroupShm, SandboxShm) {
        let group_shmid = format!("sp-test-sbox-{tag}-{}-g", std::process::id());
        let sbox_shmid = format!("sp-test-sbox-{tag}-{}-s", std::process::id());
        let group = GroupShm::create(&group_shmid).unwrap();
        let sbox = SandboxShm::create(&sbox_shmid).unwrap();
        let app = Arc::new(App::new(&group_shmid, &sbox_shmid, 48000.0).unwrap());
        (app, group, sbox)
    }

    #[test]
    fn test_adapter_registry_smoke() {
        assert!(instantiate_adapter(PluginFormat::Unknown, "", BUILTIN_GAIN_ID).is_ok());
    }

    /// Drive two chained gain devices through one full buffer the way the
    /// audio worker does, checking the side discipline end to end.
    #[test]
    fn test_process_buffer_chains_devices() {
        let (app, _group, _sbox) = test_app("chain");
        // Build D1 -> D2 through the real create/connect paths.
        use soundproof_ipc::msg::ClientMsg;
        msgproc_dispatch(&app, ClientMsg::DeviceCreate {
            dev: DeviceId(1),
            format: PluginFormat::Unknown,
            plugfile_path: String::new(),
            plugin_ext_id: BUILTIN_GAIN_ID.to_string(),
            callback: 0,
        });
        msgproc_dispatch(&app, ClientMsg::DeviceCreate {
            dev: DeviceId(2),
            format: PluginFormat::Unknown,
            plugfile_path: String::new(),
            plugin_ext_id: BUILTIN_GAIN_ID.to_string(),
            callback: 1,
        });
        msgproc_dispatch(&app, ClientMsg::DeviceConnect {
            out_dev: DeviceId(1),
            out_port: 0,
            out_ports_shmid: String::new(),
            in_dev: DeviceId(2),
            in_port: 0,
        });

        // The client writes entry inputs at the backside `E & 1` (`E` the
        // epoch prior to the one it publishes) and reads outputs at the
        // frontside -- mirror exactly what `audio_process` does.
        let epoch = 1u64;
        let backside = ((epoch - 1) & 1) as usize;
        let frontside = (epoch & 1) as usize;
        app.model.with(|m| {
            let d1 = &m.devices[&DeviceId(1)];
            unsafe {
                d1.service.ports.data().input(0, backside).fill(0.5);
            }
        });

        app.model.with(|m| process_buffer(m, epoch));

        app.model.with(|m| {
            let d1 = &m.devices[&DeviceId(1)];
            let d2 = &m.devices[&DeviceId(2)];
            unsafe {
                // D1 read the side the client wrote and passed it through
                // at unity gain to the frontside.
                assert_eq!(d1.service.ports.data().output(0, frontside)[0], 0.5);
                // The local connection copied D1's frontside output into
                // D2's backside input, and D2 passed it through.
                assert_eq!(d2.service.ports.data().input(0, backside)[0], 0.5);
                assert_eq!(d2.service.ports.data().output(0, frontside)[0], 0.5);
                // The frontside of the input pair and the backside of the
                // output pair were untouched.
                assert_eq!(d2.service.ports.data().input(0, frontside)[0], 0.0);
                assert_eq!(d2.service.ports.data().output(0, backside)[0], 0.0);
            }
        });
    }

    /// Events queued from the main thread reach the adapter on the next
    /// buffer.
    #[test]
    fn test_main_thread_event_reaches_adapter() {
        let (app, _group, _sbox) = test_app("events");
        use soundproof_ipc::msg::ClientMsg;
        msgproc_dispatch(&app, ClientMsg::DeviceCreate {
            dev: DeviceId(1),
            format: PluginFormat::Unknown,
            plugfile_path: String::new(),
            plugin_ext_id: BUILTIN_GAIN_ID.to_string(),
            callback: 0,
        });
        // Gain 0.25 via a param event.
        msgproc_dispatch(&app, ClientMsg::Event {
            dev: DeviceId(1),
            event: Event::ParamValue { time: 0, param: 0, value: 0.25 },
        });

        // Simulate the client: input at the backside, output read at the
        // frontside.
        let epoch = 4u64;
        let backside = ((epoch - 1) & 1) as usize;
        let frontside = (epoch & 1) as usize;
        app.model.with(|m| {
            let d1 = &m.devices[&DeviceId(1)];
            unsafe {
                d1.service.ports.data().input(0, backside).fill(1.0);
            }
        });
        app.model.with(|m| process_buffer(m, epoch));
        app.model.with(|m| {
            let d1 = &m.devices[&DeviceId(1)];
            unsafe {
                let out = d1.service.ports.data().output(0, frontside);
                assert!(out.iter().take(SAMPLES_PER_PORT).all(|&s| (s - 0.25).abs() < 1e-6));
            }
        });
    }

    /// Route a message through the real wire framing and ring, exactly as
    /// the client would deliver it.
    fn msgproc_dispatch(app: &Arc<App>, msg: soundproof_ipc::msg::ClientMsg) {
        let sender = soundproof_ipc::wire::Sender::new();
        sender.enqueue(msg);
        sender.send(|bytes| app.sbox.data().msgs_in.write(bytes));
        msgproc::process_messages(app);
    }
}
