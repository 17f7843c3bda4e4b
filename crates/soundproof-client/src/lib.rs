//! Client library for hosting third-party audio plugins in sandboxed
//! child processes.
//!
//! The host application initializes an [`Instance`], creates groups and
//! sandboxes, puts devices inside them, and connects device audio ports
//! freely across the sandboxes of a group. Plugin crashes take down a
//! single sandbox process, never the host. The realtime side is driven by
//! calling [`Instance::audio_process`] once per buffer from the host's
//! audio callback.

pub mod audio;
pub mod model;
pub mod report;
pub mod scan;
pub mod service;

mod instance;

pub use audio::{EventSink, GroupProcess, InputBinding, OutputBinding, PortSamples, PortSamplesMut};
pub use instance::Instance;
pub use report::{GeneralReport, GroupReport};
pub use scan::ScanFlags;
pub use service::{ReturnBytes, ReturnDevice, ReturnDouble, ReturnString};

pub use soundproof_core::events::Event;
pub use soundproof_core::ids::{DeviceId, GroupId, ParamIdx, PlugfileId, PluginId, SandboxId};
pub use soundproof_core::{Error, PluginFormat, RenderMode, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_group_lifecycle() {
        let instance = Instance::init().unwrap();
        let group = instance.create_group(48000.0).unwrap();
        assert!(instance.activate(group).is_ok());
        assert!(instance.deactivate(group).is_ok());
        assert!(instance.erase_group(group).is_ok());
        // Erasing twice is a topology error, not a crash.
        assert!(instance.erase_group(group).is_err());
        instance.shutdown();
    }

    #[test]
    fn test_create_device_with_unknown_plugin_is_sticky_error() {
        let instance = Instance::init().unwrap();
        let group = instance.create_group(48000.0).unwrap();
        // Binary path is bogus: the sandbox entity exists in an error state.
        let sbox = instance
            .create_sandbox(group, std::path::Path::new("/nonexistent/soundproof-sbox"))
            .unwrap();
        assert!(!instance.is_running(sbox));
        assert!(!instance.sandbox_error(sbox).unwrap().is_empty());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let dev = instance
            .create_device(
                sbox,
                PluginFormat::Clap,
                "studio.kx.distrho.MaGigaverb",
                Box::new(move |_dev, success| {
                    assert!(!success);
                    fired_in_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        // The callback ran inline: the plugin is unknown.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!instance.was_loaded_successfully(dev));
        assert_eq!(instance.device_error(dev).unwrap(), "Plugin not found.");

        // The per-group reporter saw the device error and the sandbox
        // spawn failure.
        let mut device_errors = 0;
        let mut sbox_errors = 0;
        instance.receive_group_reports(group, |report| match report {
            GroupReport::DeviceError { .. } => device_errors += 1,
            GroupReport::SboxError { .. } => sbox_errors += 1,
            _ => {}
        });
        assert_eq!(device_errors, 1);
        assert_eq!(sbox_errors, 1);
        instance.shutdown();
    }

    #[test]
    fn test_create_device_against_missing_sandbox_fails() {
        let instance = Instance::init().unwrap();
        let result = instance.create_device(
            SandboxId(404),
            PluginFormat::Clap,
            "some.plugin",
            Box::new(|_, _| {}),
        );
        assert!(result.is_err());
        instance.shutdown();
    }

    #[test]
    fn test_connect_requires_same_group() {
        let instance = Instance::init().unwrap();
        let g1 = instance.create_group(48000.0).unwrap();
        let g2 = instance.create_group(48000.0).unwrap();
        let missing = std::path::Path::new("/nonexistent/soundproof-sbox");
        let s1 = instance.create_sandbox(g1, missing).unwrap();
        let s2 = instance.create_sandbox(g2, missing).unwrap();
        let d1 = instance
            .create_device(s1, PluginFormat::Clap, "a.plugin", Box::new(|_, _| {}))
            .unwrap();
        let d2 = instance
            .create_device(s2, PluginFormat::Clap, "b.plugin", Box::new(|_, _| {}))
            .unwrap();
        assert!(instance.connect(d1, 0, d2, 0).is_err());
        // Port overflow is refused outright.
        let d3 = instance
            .create_device(s1, PluginFormat::Clap, "c.plugin", Box::new(|_, _| {}))
            .unwrap();
        assert!(instance.connect(d1, 99, d3, 0).is_err());
        instance.shutdown();
    }

    #[test]
    fn test_erased_sandbox_rejects_new_devices() {
        let instance = Instance::init().unwrap();
        let group = instance.create_group(48000.0).unwrap();
        let missing = std::path::Path::new("/nonexistent/soundproof-sbox");
        let sbox = instance.create_sandbox(group, missing).unwrap();
        let dev = instance
            .create_device(sbox, PluginFormat::Clap, "a.plugin", Box::new(|_, _| {}))
            .unwrap();
        instance.erase_sandbox(sbox).unwrap();
        // Device went with the sandbox.
        assert!(instance.device_error(dev).is_err());
        // Creating against the erased id raises a topology error.
        assert!(
            instance
                .create_device(sbox, PluginFormat::Clap, "a.plugin", Box::new(|_, _| {}))
                .is_err()
        );
        // A fresh sandbox in the same group works.
        let fresh = instance.create_sandbox(group, missing).unwrap();
        assert!(
            instance
                .create_device(fresh, PluginFormat::Clap, "a.plugin", Box::new(|_, _| {}))
                .is_ok()
        );
        instance.shutdown();
    }

    #[test]
    fn test_device_revival_after_scan() {
        let instance = Instance::init().unwrap();
        let inner = instance.test_inner();
        let group = instance.create_group(48000.0).unwrap();
        let missing = std::path::Path::new("/nonexistent/soundproof-sbox");
        let sbox = instance.create_sandbox(group, missing).unwrap();

        let dev = instance
            .create_device(
                sbox,
                PluginFormat::Clap,
                "studio.kx.distrho.MaGigaverb",
                Box::new(|_, _| {}),
            )
            .unwrap();
        assert!(!instance.was_loaded_successfully(dev));

        // A scan finds the plugin; the revival path resolves the device and
        // fires off a remote create.
        scan::handle_record(
            &inner,
            soundproof_scan::ScanRecord::Plugin {
                plugfile_type: "clap".to_string(),
                path: "/p/verb.clap".to_string(),
                name: "MaGigaverb".to_string(),
                id: "studio.kx.distrho.MaGigaverb".to_string(),
                vendor: "DISTRHO".to_string(),
                version: "1.0".to_string(),
                url: String::new(),
                features: vec!["audio-effect".to_string(), "reverb".to_string()],
                has_gui: true,
                has_params: true,
            },
            ScanFlags { reload_failed_devices: true },
        );

        inner.model.with(|m| {
            let device = m.devices.get(&dev).unwrap();
            assert!(device.plugin.is_valid(), "revival must resolve the plugin id");
            assert!(device.error.is_empty(), "revival clears the sticky error");
            assert_eq!(device.name, "MaGigaverb");
        });
        instance.shutdown();
    }

    /// `audio_process` against an unknown group degrades to silence
    /// without blocking or erroring.
    #[test]
    fn test_audio_process_unknown_group_is_silent() {
        let instance = Instance::init().unwrap();
        let mut left = vec![1.0_f32; soundproof_core::SAMPLES_PER_PORT];
        let mut ports = [PortSamplesMut { port: 0, samples: &mut left }];
        let mut events = Vec::new();
        let mut outputs =
            [OutputBinding { dev: DeviceId(0), ports: &mut ports, events: &mut events }];
        let mut process =
            GroupProcess { group: GroupId(1234), inputs: &[], outputs: &mut outputs };
        instance.audio_process(&mut process);
        assert!(left.iter().all(|&s| s == 0.0));
        instance.shutdown();
    }

    /// Drive the client's `audio_process` and a real in-process sandbox
    /// half against the same shared segments, for several consecutive
    /// epochs. The sandbox must read the exact samples the client wrote
    /// during the same buffer, and the client must read them back through
    /// the device's output -- this pins the backside/frontside agreement
    /// between the two processes.
    #[test]
    fn test_audio_process_and_sandbox_agree_on_buffer_sides() {
        use soundproof_plugin::builtin::BUILTIN_GAIN_ID;
        use std::time::{Duration, Instant};

        let instance = Instance::init().unwrap();
        let inner = instance.test_inner();
        let group = instance.create_group(48000.0).unwrap();
        // The child spawn fails (bogus path); the segments and transport
        // exist regardless, and the sandbox half runs in this process.
        let sbox = instance
            .create_sandbox(group, std::path::Path::new("/nonexistent/soundproof-sbox"))
            .unwrap();

        // Seed the plugin table so create_device resolves the builtin.
        scan::handle_record(
            &inner,
            soundproof_scan::ScanRecord::Plugin {
                plugfile_type: "unknown".to_string(),
                path: "/builtin/gain".to_string(),
                name: "Gain".to_string(),
                id: BUILTIN_GAIN_ID.to_string(),
                vendor: "soundproof".to_string(),
                version: "1.0.0".to_string(),
                url: String::new(),
                features: Vec::new(),
                has_gui: false,
                has_params: true,
            },
            ScanFlags::default(),
        );

        let (group_shmid, sbox_shmid) = inner.model.with(|m| {
            (
                m.groups[&group].service.shm.id().to_string(),
                m.sandboxes[&sbox].service.shmid().to_string(),
            )
        });
        let sbox_app = std::sync::Arc::new(
            soundproof_sbox::app::App::new(&group_shmid, &sbox_shmid, 48000.0).unwrap(),
        );

        let dev = instance
            .create_device(sbox, PluginFormat::Unknown, BUILTIN_GAIN_ID, Box::new(|_, _| {}))
            .unwrap();
        // The client poll thread flushes the create; pump the sandbox side
        // until the reply lands and the device becomes healthy.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !instance.was_loaded_successfully(dev) {
            soundproof_sbox::msgproc::process_messages(&sbox_app);
            assert!(Instant::now() < deadline, "device creation did not complete");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Start the real audio worker on the group's start event.
        let snapshots = sbox_app.snapshots.lock().take().unwrap();
        *sbox_app.worker.lock() = Some(soundproof_sbox::audio::start(&sbox_app, snapshots));

        // Distinct samples per epoch: a side mismatch would surface as the
        // previous buffer's value (or zeros) coming back.
        for step in 1..=3u32 {
            let value = step as f32 * 0.125;
            let input = vec![value; soundproof_core::SAMPLES_PER_PORT];
            let mut output = vec![-1.0_f32; soundproof_core::SAMPLES_PER_PORT];
            let in_ports = [PortSamples { port: 0, samples: &input }];
            let inputs = [InputBinding { dev, ports: &in_ports, events: &[] }];
            let mut out_ports = [PortSamplesMut { port: 0, samples: &mut output }];
            let mut events_out: Vec<Event> = Vec::new();
            let mut outputs =
                [OutputBinding { dev, ports: &mut out_ports, events: &mut events_out }];
            let mut process = GroupProcess { group, inputs: &inputs, outputs: &mut outputs };
            instance.audio_process(&mut process);
            assert!(
                output.iter().all(|&s| s == value),
                "epoch {step}: expected {value} back through the unity-gain device, got {:?}",
                &output[..4]
            );
        }

        soundproof_sbox::audio::stop(&sbox_app);
        instance.shutdown();
    }

    /// Epoch monotonicity with an empty group: every call publishes a
    /// strictly larger epoch and returns without timeout.
    #[test]
    fn test_audio_process_epoch_monotonic() {
        let instance = Instance::init().unwrap();
        let inner = instance.test_inner();
        let group = instance.create_group(48000.0).unwrap();
        instance.activate(group).unwrap();

        let mut last_epoch = 0;
        for _ in 0..1000 {
            let mut process = GroupProcess { group, inputs: &[], outputs: &mut [] };
            instance.audio_process(&mut process);
            let epoch = inner.model.with(|m| {
                m.groups[&group]
                    .service
                    .shm
                    .data()
                    .epoch
                    .load(std::sync::atomic::Ordering::Acquire)
            });
            assert!(epoch > last_epoch, "epoch must be strictly monotonic");
            last_epoch = epoch;
        }
        // No sandboxes -> fan-in resolves instantly -> no lost buffers.
        let timeouts = inner.model.with(|m| m.groups[&group].service.take_timeouts());
        assert_eq!(timeouts, 0);
        instance.shutdown();
    }
}
