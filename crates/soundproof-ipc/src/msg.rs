//! The client ⇄ sandbox message set.
//!
//! Each direction has its own tag space. Operations expecting a reply carry
//! a `callback` token allocated from the client's slot buffers; the reply
//! echoes it so the stored continuation can be dispatched.

use crate::wire::{
    WireError, WireMsg, WireReader, put_bytes, put_f64, put_i16, put_i64, put_str, put_u8,
    put_u16, put_u32, put_u64,
};
use soundproof_core::events::Event;
use soundproof_core::ids::DeviceId;
use soundproof_core::{PluginFormat, RenderMode};

/// Messages sent from the client to a sandbox process.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// Start audio processing at the given sample rate.
    Activate { sr: f64 },
    CleanShutdown,
    CloseAllEditors,
    /// Tell the sandbox process to crash. Important for testing.
    Crash,
    Deactivate,
    DeviceConnect {
        out_dev: DeviceId,
        out_port: usize,
        /// Ports segment of the source device, so a sandbox that only hosts
        /// the destination can map the source's output buffers.
        out_ports_shmid: String,
        in_dev: DeviceId,
        in_port: usize,
    },
    DeviceCreate {
        dev: DeviceId,
        format: PluginFormat,
        plugfile_path: String,
        plugin_ext_id: String,
        callback: u64,
    },
    DeviceDisconnect { out_dev: DeviceId, out_port: usize, in_dev: DeviceId, in_port: usize },
    DeviceErase { dev: DeviceId },
    DeviceGuiHide { dev: DeviceId },
    DeviceGuiShow { dev: DeviceId },
    DeviceLoad { dev: DeviceId, state: Vec<u8>, callback: u64 },
    DeviceSave { dev: DeviceId, callback: u64 },
    DeviceSetRenderMode { dev: DeviceId, mode: RenderMode },
    /// Push one event to a device; drained into the device's event ring by
    /// the sandbox audio worker on the next buffer.
    Event { dev: DeviceId, event: Event },
    GetParamValue { dev: DeviceId, param_idx: usize, callback: u64 },
    GetParamValueText { dev: DeviceId, param_idx: usize, value: f64, callback: u64 },
    /// Sandbox shuts itself down if this isn't received within a certain time.
    Heartbeat,
}

/// Messages sent back from a sandbox process to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxMsg {
    ConfirmActivated,
    DeviceEditorVisibleChanged { dev: DeviceId, visible: bool, native_handle: i64 },
    /// The device's parameters were rescanned into a fresh segment.
    DeviceParamInfoChanged { dev: DeviceId, new_shmid: String },
    ReportError { text: String },
    ReportFatalError { text: String },
    ReportInfo { text: String },
    ReportWarning { text: String },
    /// Reply to `DeviceCreate`. `error` empty means success and the three
    /// segment ids are valid.
    ReturnCreatedDevice {
        dev: DeviceId,
        dev_shmid: String,
        ports_shmid: String,
        params_shmid: String,
        error: String,
        callback: u64,
    },
    /// Reply to `DeviceLoad`. `error` empty means success.
    ReturnLoadResult { dev: DeviceId, error: String, callback: u64 },
    ReturnParamValue { value: f64, callback: u64 },
    ReturnParamValueText { text: String, callback: u64 },
    ReturnState { bytes: Vec<u8>, callback: u64 },
}

fn put_dev(out: &mut Vec<u8>, dev: DeviceId) {
    put_i64(out, dev.0);
}

fn get_dev(r: &mut WireReader<'_>) -> Result<DeviceId, WireError> {
    Ok(DeviceId(r.i64()?))
}

pub fn put_event(out: &mut Vec<u8>, event: &Event) {
    match *event {
        Event::NoteOn { time, channel, key, velocity } => {
            put_u32(out, 0);
            put_u32(out, time);
            put_i16(out, channel);
            put_i16(out, key);
            put_f64(out, velocity);
        }
        Event::NoteOff { time, channel, key, velocity } => {
            put_u32(out, 1);
            put_u32(out, time);
            put_i16(out, channel);
            put_i16(out, key);
            put_f64(out, velocity);
        }
        Event::NoteChoke { time, channel, key } => {
            put_u32(out, 2);
            put_u32(out, time);
            put_i16(out, channel);
            put_i16(out, key);
        }
        Event::ParamValue { time, param, value } => {
            put_u32(out, 3);
            put_u32(out, time);
            put_u32(out, param);
            put_f64(out, value);
        }
        Event::ParamMod { time, param, amount } => {
            put_u32(out, 4);
            put_u32(out, time);
            put_u32(out, param);
            put_f64(out, amount);
        }
        Event::ParamGestureBegin { time, param } => {
            put_u32(out, 5);
            put_u32(out, time);
            put_u32(out, param);
        }
        Event::ParamGestureEnd { time, param } => {
            put_u32(out, 6);
            put_u32(out, time);
            put_u32(out, param);
        }
        Event::Midi { time, port, data } => {
            put_u32(out, 7);
            put_u32(out, time);
            put_u16(out, port);
            out.extend_from_slice(&data);
        }
    }
}

pub fn get_event(r: &mut WireReader<'_>) -> Result<Event, WireError> {
    let kind = r.u32()?;
    Ok(match kind {
        0 => Event::NoteOn { time: r.u32()?, channel: r.i16()?, key: r.i16()?, velocity: r.f64()? },
        1 => Event::NoteOff { time: r.u32()?, channel: r.i16()?, key: r.i16()?, velocity: r.f64()? },
        2 => Event::NoteChoke { time: r.u32()?, channel: r.i16()?, key: r.i16()? },
        3 => Event::ParamValue { time: r.u32()?, param: r.u32()?, value: r.f64()? },
        4 => Event::ParamMod { time: r.u32()?, param: r.u32()?, amount: r.f64()? },
        5 => Event::ParamGestureBegin { time: r.u32()?, param: r.u32()? },
        6 => Event::ParamGestureEnd { time: r.u32()?, param: r.u32()? },
        7 => Event::Midi { time: r.u32()?, port: r.u16()?, data: r.byte_array()? },
        other => {
            return Err(WireError::BadEnum { what: "event kind", value: u64::from(other) });
        }
    })
}

impl WireMsg for ClientMsg {
    fn tag(&self) -> u64 {
        match self {
            Self::Activate { .. } => 0,
            Self::CleanShutdown => 1,
            Self::CloseAllEditors => 2,
            Self::Crash => 3,
            Self::Deactivate => 4,
            Self::DeviceConnect { .. } => 5,
            Self::DeviceCreate { .. } => 6,
            Self::DeviceDisconnect { .. } => 7,
            Self::DeviceErase { .. } => 8,
            Self::DeviceGuiHide { .. } => 9,
            Self::DeviceGuiShow { .. } => 10,
            Self::DeviceLoad { .. } => 11,
            Self::DeviceSave { .. } => 12,
            Self::DeviceSetRenderMode { .. } => 13,
            Self::Event { .. } => 14,
            Self::GetParamValue { .. } => 15,
            Self::GetParamValueText { .. } => 16,
            Self::Heartbeat => 17,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Activate { sr } => put_f64(out, *sr),
            Self::CleanShutdown | Self::CloseAllEditors | Self::Crash | Self::Deactivate
            | Self::Heartbeat => {}
            Self::DeviceConnect { out_dev, out_port, out_ports_shmid, in_dev, in_port } => {
                put_dev(out, *out_dev);
                put_u64(out, *out_port as u64);
                put_str(out, out_ports_shmid);
                put_dev(out, *in_dev);
                put_u64(out, *in_port as u64);
            }
            Self::DeviceCreate { dev, format, plugfile_path, plugin_ext_id, callback } => {
                put_dev(out, *dev);
                put_u8(out, *format as u8);
                put_str(out, plugfile_path);
                put_str(out, plugin_ext_id);
                put_u64(out, *callback);
            }
            Self::DeviceDisconnect { out_dev, out_port, in_dev, in_port } => {
                put_dev(out, *out_dev);
                put_u64(out, *out_port as u64);
                put_dev(out, *in_dev);
                put_u64(out, *in_port as u64);
            }
            Self::DeviceErase { dev }
            | Self::DeviceGuiHide { dev }
            | Self::DeviceGuiShow { dev } => put_dev(out, *dev),
            Self::DeviceLoad { dev, state, callback } => {
                put_dev(out, *dev);
                put_bytes(out, state);
                put_u64(out, *callback);
            }
            Self::DeviceSave { dev, callback } => {
                put_dev(out, *dev);
                put_u64(out, *callback);
            }
            Self::DeviceSetRenderMode { dev, mode } => {
                put_dev(out, *dev);
                put_u8(out, *mode as u8);
            }
            Self::Event { dev, event } => {
                put_dev(out, *dev);
                put_event(out, event);
            }
            Self::GetParamValue { dev, param_idx, callback } => {
                put_dev(out, *dev);
                put_u64(out, *param_idx as u64);
                put_u64(out, *callback);
            }
            Self::GetParamValueText { dev, param_idx, value, callback } => {
                put_dev(out, *dev);
                put_u64(out, *param_idx as u64);
                put_f64(out, *value);
                put_u64(out, *callback);
            }
        }
    }

    fn decode(tag: u64, r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(match tag {
            0 => Self::Activate { sr: r.f64()? },
            1 => Self::CleanShutdown,
            2 => Self::CloseAllEditors,
            3 => Self::Crash,
            4 => Self::Deactivate,
            5 => Self::DeviceConnect {
                out_dev: get_dev(r)?,
                out_port: r.u64()? as usize,
                out_ports_shmid: r.str()?,
                in_dev: get_dev(r)?,
                in_port: r.u64()? as usize,
            },
            6 => Self::DeviceCreate {
                dev: get_dev(r)?,
                format: PluginFormat::from_u8(r.u8()?),
                plugfile_path: r.str()?,
                plugin_ext_id: r.str()?,
                callback: r.u64()?,
            },
            7 => Self::DeviceDisconnect {
                out_dev: get_dev(r)?,
                out_port: r.u64()? as usize,
                in_dev: get_dev(r)?,
                in_port: r.u64()? as usize,
            },
            8 => Self::DeviceErase { dev: get_dev(r)? },
            9 => Self::DeviceGuiHide { dev: get_dev(r)? },
            10 => Self::DeviceGuiShow { dev: get_dev(r)? },
            11 => Self::DeviceLoad { dev: get_dev(r)?, state: r.bytes()?, callback: r.u64()? },
            12 => Self::DeviceSave { dev: get_dev(r)?, callback: r.u64()? },
            13 => Self::DeviceSetRenderMode {
                dev: get_dev(r)?,
                mode: RenderMode::from_u8(r.u8()?),
            },
            14 => Self::Event { dev: get_dev(r)?, event: get_event(r)? },
            15 => Self::GetParamValue {
                dev: get_dev(r)?,
                param_idx: r.u64()? as usize,
                callback: r.u64()?,
            },
            16 => Self::GetParamValueText {
                dev: get_dev(r)?,
                param_idx: r.u64()? as usize,
                value: r.f64()?,
                callback: r.u64()?,
            },
            17 => Self::Heartbeat,
            other => return Err(WireError::BadTag(other)),
        })
    }
}

impl WireMsg for SandboxMsg {
    fn tag(&self) -> u64 {
        match self {
            Self::ConfirmActivated => 0,
            Self::DeviceEditorVisibleChanged { .. } => 1,
            Self::DeviceParamInfoChanged { .. } => 2,
            Self::ReportError { .. } => 3,
            Self::ReportFatalError { .. } => 4,
            Self::ReportInfo { .. } => 5,
            Self::ReportWarning { .. } => 6,
            Self::ReturnCreatedDevice { .. } => 7,
            Self::ReturnLoadResult { .. } => 8,
            Self::ReturnParamValue { .. } => 9,
            Self::ReturnParamValueText { .. } => 10,
            Self::ReturnState { .. } => 11,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::ConfirmActivated => {}
            Self::DeviceEditorVisibleChanged { dev, visible, native_handle } => {
                put_dev(out, *dev);
                put_u8(out, u8::from(*visible));
                put_i64(out, *native_handle);
            }
            Self::DeviceParamInfoChanged { dev, new_shmid } => {
                put_dev(out, *dev);
                put_str(out, new_shmid);
            }
            Self::ReportError { text }
            | Self::ReportFatalError { text }
            | Self::ReportInfo { text }
            | Self::ReportWarning { text } => put_str(out, text),
            Self::ReturnCreatedDevice {
                dev,
                dev_shmid,
                ports_shmid,
                params_shmid,
                error,
                callback,
            } => {
                put_dev(out, *dev);
                put_str(out, dev_shmid);
                put_str(out, ports_shmid);
                put_str(out, params_shmid);
                put_str(out, error);
                put_u64(out, *callback);
            }
            Self::ReturnLoadResult { dev, error, callback } => {
                put_dev(out, *dev);
                put_str(out, error);
                put_u64(out, *callback);
            }
            Self::ReturnParamValue { value, callback } => {
                put_f64(out, *value);
                put_u64(out, *callback);
            }
            Self::ReturnParamValueText { text, callback } => {
                put_str(out, text);
                put_u64(out, *callback);
            }
            Self::ReturnState { bytes, callback } => {
                put_bytes(out, bytes);
                put_u64(out, *callback);
            }
        }
    }

    fn decode(tag: u64, r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(match tag {
            0 => Self::ConfirmActivated,
            1 => Self::DeviceEditorVisibleChanged {
                dev: get_dev(r)?,
                visible: r.u8()? != 0,
                native_handle: r.i64()?,
            },
            2 => Self::DeviceParamInfoChanged { dev: get_dev(r)?, new_shmid: r.str()? },
            3 => Self::ReportError { text: r.str()? },
            4 => Self::ReportFatalError { text: r.str()? },
            5 => Self::ReportInfo { text: r.str()? },
            6 => Self::ReportWarning { text: r.str()? },
            7 => Self::ReturnCreatedDevice {
                dev: get_dev(r)?,
                dev_shmid: r.str()?,
                ports_shmid: r.str()?,
                params_shmid: r.str()?,
                error: r.str()?,
                callback: r.u64()?,
            },
            8 => Self::ReturnLoadResult { dev: get_dev(r)?, error: r.str()?, callback: r.u64()? },
            9 => Self::ReturnParamValue { value: r.f64()?, callback: r.u64()? },
            10 => Self::ReturnParamValueText { text: r.str()?, callback: r.u64()? },
            11 => Self::ReturnState { bytes: r.bytes()?, callback: r.u64()? },
            other => return Err(WireError::BadTag(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Receiver, Sender};

    fn round_trip<T: WireMsg + Clone + PartialEq + std::fmt::Debug>(msgs: Vec<T>) {
        let sender = Sender::new();
        let receiver = Receiver::new();
        let mut pipe: Vec<u8> = Vec::new();
        for m in &msgs {
            sender.enqueue(m.clone());
        }
        sender.send(|bytes| {
            pipe.extend_from_slice(bytes);
            bytes.len()
        });
        let mut cursor = 0;
        let got = receiver
            .receive(|buf| {
                let n = buf.len().min(pipe.len() - cursor);
                buf[..n].copy_from_slice(&pipe[cursor..cursor + n]);
                cursor += n;
                n
            })
            .unwrap();
        assert_eq!(got, msgs);
    }

    #[test]
    fn test_client_msgs_round_trip() {
        round_trip(vec![
            ClientMsg::Activate { sr: 48000.0 },
            ClientMsg::CleanShutdown,
            ClientMsg::CloseAllEditors,
            ClientMsg::Crash,
            ClientMsg::Deactivate,
            ClientMsg::DeviceConnect {
                out_dev: DeviceId(1),
                out_port: 0,
                out_ports_shmid: "sp+1+sbox+0+dev+1+0+ports".to_string(),
                in_dev: DeviceId(2),
                in_port: 1,
            },
            ClientMsg::DeviceCreate {
                dev: DeviceId(3),
                format: PluginFormat::Clap,
                plugfile_path: "/plugins/verb.clap".to_string(),
                plugin_ext_id: "studio.kx.distrho.MaGigaverb".to_string(),
                callback: 5,
            },
            ClientMsg::DeviceDisconnect {
                out_dev: DeviceId(1),
                out_port: 0,
                in_dev: DeviceId(2),
                in_port: 0,
            },
            ClientMsg::DeviceErase { dev: DeviceId(3) },
            ClientMsg::DeviceGuiHide { dev: DeviceId(3) },
            ClientMsg::DeviceGuiShow { dev: DeviceId(3) },
            ClientMsg::DeviceLoad { dev: DeviceId(3), state: vec![1, 2, 3], callback: 6 },
            ClientMsg::DeviceSave { dev: DeviceId(3), callback: 7 },
            ClientMsg::DeviceSetRenderMode { dev: DeviceId(3), mode: RenderMode::Offline },
            ClientMsg::Event {
                dev: DeviceId(3),
                event: Event::NoteOn { time: 1, channel: 0, key: 60, velocity: 0.5 },
            },
            ClientMsg::GetParamValue { dev: DeviceId(3), param_idx: 2, callback: 8 },
            ClientMsg::GetParamValueText {
                dev: DeviceId(3),
                param_idx: 2,
                value: 0.25,
                callback: 9,
            },
            ClientMsg::Heartbeat,
        ]);
    }

    #[test]
    fn test_sandbox_msgs_round_trip() {
        round_trip(vec![
            SandboxMsg::ConfirmActivated,
            SandboxMsg::DeviceEditorVisibleChanged {
                dev: DeviceId(1),
                visible: true,
                native_handle: 0xBEEF,
            },
            SandboxMsg::DeviceParamInfoChanged {
                dev: DeviceId(1),
                new_shmid: "sp+1+sbox+0+dev+1+1+params".to_string(),
            },
            SandboxMsg::ReportError { text: "e".to_string() },
            SandboxMsg::ReportFatalError { text: "f".to_string() },
            SandboxMsg::ReportInfo { text: "i".to_string() },
            SandboxMsg::ReportWarning { text: "w".to_string() },
            SandboxMsg::ReturnCreatedDevice {
                dev: DeviceId(1),
                dev_shmid: "a".to_string(),
                ports_shmid: "b".to_string(),
                params_shmid: "c".to_string(),
                error: String::new(),
                callback: 1,
            },
            SandboxMsg::ReturnLoadResult {
                dev: DeviceId(1),
                error: "bad state".to_string(),
                callback: 2,
            },
            SandboxMsg::ReturnParamValue { value: 0.5, callback: 3 },
            SandboxMsg::ReturnParamValueText { text: "50%".to_string(), callback: 4 },
            SandboxMsg::ReturnState { bytes: vec![0xAA; 1000], callback: 5 },
        ]);
    }

    #[test]
    fn test_all_event_kinds_round_trip() {
        let events = [
            Event::NoteOn { time: 1, channel: 2, key: 3, velocity: 0.4 },
            Event::NoteOff { time: 1, channel: 2, key: 3, velocity: 0.0 },
            Event::NoteChoke { time: 1, channel: 2, key: 3 },
            Event::ParamValue { time: 1, param: 2, value: 3.0 },
            Event::ParamMod { time: 1, param: 2, amount: -1.0 },
            Event::ParamGestureBegin { time: 1, param: 2 },
            Event::ParamGestureEnd { time: 1, param: 2 },
            Event::Midi { time: 1, port: 0, data: [0x90, 60, 100] },
        ];
        for event in events {
            let mut buf = Vec::new();
            put_event(&mut buf, &event);
            let mut r = WireReader::new(&buf);
            assert_eq!(get_event(&mut r).unwrap(), event);
            assert_eq!(r.remaining(), 0);
        }
    }
}
