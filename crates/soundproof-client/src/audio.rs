//! The realtime entry point: one call per audio buffer.
//!
//! `audio_process` never blocks unboundedly, never allocates, and never
//! fails: a group that doesn't finish in time degrades to silence for that
//! buffer and increments an atomic the poll thread turns into a report.
//!
//! Buffer sides, with `E` the epoch prior to this buffer (this call
//! publishes `E + 1`): entry-device inputs and input events are written at
//! the backside `E & 1` before signaling; exit-device outputs and output
//! events are read at the frontside `(E + 1) & 1` after the fan-in
//! completes. The sandboxes read the backside and write the frontside of
//! this same buffer, so what is written here is processed and read back
//! within the call.

use crate::instance::Inner;
use soundproof_core::events::Event;
use soundproof_core::ids::{DeviceId, GroupId};
use soundproof_ipc::signal;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Sandboxes not completing a buffer within this budget is treated as a
/// lost buffer, not a crash; the group resumes on the next one.
const DONE_TIMEOUT: Duration = Duration::from_secs(1);

/// Destination for events popped off an exit device.
pub trait EventSink {
    fn push(&mut self, event: Event);
}

impl EventSink for Vec<Event> {
    fn push(&mut self, event: Event) {
        Vec::push(self, event);
    }
}

/// Audio for one port: `CHANNEL_COUNT * VECTOR_SIZE` samples,
/// channel-major.
pub struct PortSamples<'a> {
    pub port: usize,
    pub samples: &'a [f32],
}

pub struct PortSamplesMut<'a> {
    pub port: usize,
    pub samples: &'a mut [f32],
}

/// An entry device: audio and events the host feeds into the group.
pub struct InputBinding<'a> {
    pub dev: DeviceId,
    pub ports: &'a [PortSamples<'a>],
    pub events: &'a [Event],
}

/// An exit device: where the host collects audio and events.
pub struct OutputBinding<'a> {
    pub dev: DeviceId,
    pub ports: &'a mut [PortSamplesMut<'a>],
    pub events: &'a mut dyn EventSink,
}

/// One buffer's worth of work for one group.
pub struct GroupProcess<'a> {
    pub group: GroupId,
    pub inputs: &'a [InputBinding<'a>],
    pub outputs: &'a mut [OutputBinding<'a>],
}

fn write_silence(outputs: &mut [OutputBinding<'_>]) {
    for binding in outputs {
        for port in binding.ports.iter_mut() {
            port.samples.fill(0.0);
        }
    }
}

pub(crate) fn audio_process(inner: &Inner, process: &mut GroupProcess<'_>) {
    // The snapshot slot belongs to the audio thread; contention here means
    // misuse, and silence is the safe answer.
    let Some(mut snapshots) = inner.snapshots.try_lock() else {
        write_silence(process.outputs);
        return;
    };
    let model = snapshots.read();
    drop(snapshots);

    let Some(group) = model.groups.get(&process.group) else {
        write_silence(process.outputs);
        return;
    };
    let service = &group.service;

    let prior = service.epoch.fetch_add(1, Ordering::Relaxed);
    let epoch = prior + 1;
    let backside = (prior & 1) as usize;
    let frontside = (epoch & 1) as usize;

    // Write entry ports.
    for binding in process.inputs {
        let Some(device) = model.devices.get(&binding.dev) else {
            continue;
        };
        let Some(dev_service) = &device.service else {
            continue;
        };
        let ports = dev_service.ports.data();
        let in_count = ports.input_count();
        for port in binding.ports {
            if port.port >= in_count {
                continue;
            }
            let dst = unsafe { ports.input(port.port, backside) };
            let n = port.samples.len().min(dst.len());
            dst[..n].copy_from_slice(&port.samples[..n]);
        }
        let events = unsafe { dev_service.shm.data().events_in[backside].borrow_mut() };
        events.clear();
        for event in binding.events {
            // Bounded; surplus events are dropped.
            events.push(*event);
        }
    }

    // Publish the epoch and wake the group.
    signal::signal_sandbox_processing(
        service.shm.data(),
        &service.signals,
        group.sandboxes.len() as u32,
        epoch,
    );

    match signal::wait_for_all_sandboxes_done(service.shm.data(), &service.signals, DONE_TIMEOUT) {
        signal::WaitDoneResult::Done => {
            for binding in process.outputs.iter_mut() {
                let Some(device) = model.devices.get(&binding.dev) else {
                    for port in binding.ports.iter_mut() {
                        port.samples.fill(0.0);
                    }
                    continue;
                };
                let Some(dev_service) = &device.service else {
                    for port in binding.ports.iter_mut() {
                        port.samples.fill(0.0);
                    }
                    continue;
                };
                let ports = dev_service.ports.data();
                let out_count = ports.output_count();
                for port in binding.ports.iter_mut() {
                    if port.port >= out_count {
                        port.samples.fill(0.0);
                        continue;
                    }
                    let src = unsafe { ports.output(port.port, frontside) };
                    let n = port.samples.len().min(src.len());
                    port.samples[..n].copy_from_slice(&src[..n]);
                }
                let events = unsafe { dev_service.shm.data().events_out[frontside].borrow_mut() };
                for event in events.as_slice() {
                    binding.events.push(*event);
                }
            }
        }
        signal::WaitDoneResult::NotResponding => {
            // Lost buffer: silence out, note it for the poll thread.
            service.timeouts.fetch_add(1, Ordering::Relaxed);
            write_silence(process.outputs);
        }
    }
}
