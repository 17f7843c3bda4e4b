//! The sandbox audio worker.
//!
//! One thread per sandbox, running only while the group is activated. Each
//! iteration waits on the group start event, processes the local device
//! graph in topological order, then decrements the group fan-in counter
//! (the last sandbox to finish wakes the client).
//!
//! Buffer sides, with `E` the epoch prior to the buffer (the client
//! publishes and signals `E + 1`): each device reads inputs and input
//! events at the backside `E & 1` — the side the client filled just before
//! signaling — and writes outputs and output events at the frontside
//! `(E + 1) & 1`, which the client reads after the fan-in. Cross-sandbox
//! input edges read the peer's *previous* frontside (the current
//! backside), which is stable while the peer may still be producing the
//! current buffer.

use crate::app::{App, SboxDevice, SboxModel};
use smallvec::SmallVec;
use soundproof_comms::AudioSnapshots;
use soundproof_core::MAX_AUDIO_PORTS;
use soundproof_ipc::layout::Side;
use soundproof_ipc::msg::SandboxMsg;
use soundproof_ipc::signal;
use soundproof_plugin::ProcessIo;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long one wait for the start event may take.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive wait timeouts after which the sandbox assumes the client is
/// gone and terminates itself.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

/// Best-effort promotion of the calling thread to realtime priority.
fn promote_to_realtime_priority() {
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = 70;
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &raw const param);
        if rc != 0 {
            tracing::debug!("audio worker keeps default priority (rc={rc})");
        }
    }
}

/// Start the worker. Returns the join handle; the snapshot reader comes
/// back through it when the worker stops.
pub fn start(app: &Arc<App>, snapshots: AudioSnapshots<SboxModel>) -> JoinHandle<AudioSnapshots<SboxModel>> {
    let app = Arc::clone(app);
    std::thread::Builder::new()
        .name("sp-sbox-audio".to_string())
        .spawn(move || worker(&app, snapshots))
        .expect("spawn audio worker")
}

/// Ask a running worker to stop and collect the snapshot reader back.
pub fn stop(app: &App) {
    let Some(handle) = app.worker.lock().take() else {
        return;
    };
    app.stop.store(true, Ordering::Release);
    // Wake ourselves (and, harmlessly, our group peers) out of the wait.
    signal::sandbox_signal_self(app.group.data(), &app.signals);
    if let Ok(snapshots) = handle.join() {
        *app.snapshots.lock() = Some(snapshots);
    }
    app.stop.store(false, Ordering::Release);
}

fn worker(app: &Arc<App>, mut snapshots: AudioSnapshots<SboxModel>) -> AudioSnapshots<SboxModel> {
    tracing::debug!("audio worker started");
    promote_to_realtime_priority();
    let mut local_epoch = app.group.data().epoch.load(Ordering::Acquire);
    let mut consecutive_timeouts = 0u32;
    loop {
        let result = signal::wait_for_signaled(
            app.group.data(),
            &app.signals,
            &app.stop,
            &mut local_epoch,
            WAIT_TIMEOUT,
        );
        match result {
            signal::WaitSignaledResult::StopRequested => {
                tracing::debug!("audio worker stopping on request");
                return snapshots;
            }
            signal::WaitSignaledResult::Timeout => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    tracing::warn!("client stopped signaling; terminating sandbox");
                    app.send(SandboxMsg::ReportFatalError {
                        text: "audio worker timed out waiting for the client".to_string(),
                    });
                    app.terminate();
                    return snapshots;
                }
            }
            signal::WaitSignaledResult::Signaled => {
                consecutive_timeouts = 0;
                let model = snapshots.read();
                process_buffer(&model, local_epoch);
                signal::notify_sandbox_finished_processing(app.group.data(), &app.signals);
            }
        }
    }
}

/// Process every local device for one buffer.
///
/// `epoch` is the value the client just published (`E + 1`). A paused
/// sandbox waking to find the epoch advanced by more than one processes
/// only the current buffer; missed epochs are simply gone.
pub fn process_buffer(model: &SboxModel, epoch: u64) {
    let backside = (epoch.wrapping_sub(1) & 1) as Side;
    let frontside = (epoch & 1) as Side;
    for dev_id in &model.order {
        let Some(dev) = model.devices.get(dev_id) else {
            continue;
        };
        copy_cross_sandbox_inputs(dev, backside);
        process_device(dev, backside, frontside);
        copy_local_connections(model, dev, frontside, backside);
    }
}

/// Reader-side copies for cross-sandbox edges: pull the peer's previous
/// buffer into our input backside before processing. The peer wrote that
/// side as its frontside one epoch ago, so it is stable even while the
/// peer still works on the current buffer. At most one buffer of extra
/// latency, by design.
fn copy_cross_sandbox_inputs(dev: &SboxDevice, backside: Side) {
    let ports = dev.service.ports.data();
    let in_count = ports.input_count();
    for conn in &dev.input_conns {
        if conn.this_port >= in_count
            || conn.remote_port >= conn.remote_ports.data().output_count()
        {
            continue;
        }
        unsafe {
            let src = conn.remote_ports.data().output(conn.remote_port, backside);
            let dst = ports.input(conn.this_port, backside);
            *dst = *src;
        }
    }
}

/// Run one device's adapter: read audio and events at `in_side`, write
/// them at `out_side`. The two are always the opposite halves of the
/// double buffer.
fn process_device(dev: &SboxDevice, in_side: Side, out_side: Side) {
    let shm = dev.service.shm.data();
    let ports = dev.service.ports.data();
    let in_count = ports.input_count();
    let out_count = ports.output_count();

    let events_in = unsafe { shm.events_in[in_side & 1].borrow_mut() };
    let events_out = unsafe { shm.events_out[out_side & 1].borrow_mut() };
    events_out.clear();

    // Drain events the main thread queued since the last buffer.
    if let Some(mut rx) = dev.service.events_from_main_rx.try_lock() {
        while let Ok(event) = rx.pop() {
            events_in.push(event);
        }
    }

    // A contended adapter (main thread mid save/load) skips this buffer.
    let processed = match dev.service.adapter.try_lock() {
        Some(mut adapter) => {
            let mut in_refs: SmallVec<[&[f32]; MAX_AUDIO_PORTS]> = SmallVec::new();
            let mut out_refs: std::mem::ManuallyDrop<SmallVec<[&mut [f32]; MAX_AUDIO_PORTS]>> =
                std::mem::ManuallyDrop::new(SmallVec::new());
            unsafe {
                for port in 0..in_count {
                    in_refs.push(&ports.input(port, in_side)[..]);
                }
                for port in 0..out_count {
                    out_refs.push(&mut ports.output(port, out_side)[..]);
                }
            }
            let mut io = ProcessIo {
                audio_in: &in_refs,
                audio_out: &mut out_refs,
                events_in: events_in.as_slice(),
                events_out,
            };
            adapter.process(&mut io).is_ok()
        }
        None => false,
    };
    if !processed {
        for port in 0..out_count {
            unsafe {
                ports.output(port, out_side).fill(0.0);
            }
        }
    }
    events_in.clear();
}

/// Writer-side copies for intra-sandbox edges: push our fresh frontside
/// output into the peers' backside inputs before they process (topological
/// order guarantees they haven't yet).
fn copy_local_connections(model: &SboxModel, dev: &SboxDevice, out_side: Side, in_side: Side) {
    let src_ports = dev.service.ports.data();
    for conn in &dev.conns {
        let Some(peer) = model.devices.get(&conn.peer_dev) else {
            continue;
        };
        let dst_ports = peer.service.ports.data();
        if conn.this_port >= src_ports.output_count() || conn.peer_port >= dst_ports.input_count()
        {
            continue;
        }
        unsafe {
            let src = src_ports.output(conn.this_port, out_side);
            let dst = dst_ports.input(conn.peer_port, in_side);
            *dst = *src;
        }
    }
}
