//! Conversion between the wire event representation and CLAP events, plus
//! the tiny vtable shims (event lists, state streams) the adapter hands to
//! plugins.

use clap_sys::events::{
    clap_event_header, clap_event_midi, clap_event_note, clap_event_param_value,
    clap_input_events, clap_output_events,
};
use soundproof_core::events::{Event, EventList};
use std::ffi::c_void;

/// `CLAP_CORE_EVENT_SPACE_ID` and the core event type codes, fixed by the
/// CLAP specification.
const CORE_SPACE_ID: u16 = 0;
const TYPE_NOTE_ON: u16 = 0;
const TYPE_NOTE_OFF: u16 = 1;
const TYPE_NOTE_CHOKE: u16 = 2;
const TYPE_PARAM_VALUE: u16 = 5;
const TYPE_MIDI: u16 = 10;

/// Storage for one converted CLAP event. Every core event begins with a
/// `clap_event_header`, so a pointer to any variant doubles as a header
/// pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ClapEventAny {
    pub note: clap_event_note,
    pub param: clap_event_param_value,
    pub midi: clap_event_midi,
}

fn header(size: usize, time: u32, event_type: u16) -> clap_event_header {
    clap_event_header {
        size: size as u32,
        time,
        space_id: CORE_SPACE_ID,
        type_: event_type,
        flags: 0,
    }
}

fn note_event(event_type: u16, time: u32, channel: i16, key: i16, velocity: f64) -> ClapEventAny {
    ClapEventAny {
        note: clap_event_note {
            header: header(std::mem::size_of::<clap_event_note>(), time, event_type),
            note_id: -1,
            port_index: 0,
            channel,
            key,
            velocity,
        },
    }
}

/// Convert a wire event into its CLAP form. Events without a CLAP core
/// equivalent in our supported subset return `None` and are dropped.
pub fn to_clap(event: &Event, param_id_for_index: impl Fn(u32) -> Option<u32>) -> Option<ClapEventAny> {
    Some(match *event {
        Event::NoteOn { time, channel, key, velocity } => {
            note_event(TYPE_NOTE_ON, time, channel, key, velocity)
        }
        Event::NoteOff { time, channel, key, velocity } => {
            note_event(TYPE_NOTE_OFF, time, channel, key, velocity)
        }
        Event::NoteChoke { time, channel, key } => {
            note_event(TYPE_NOTE_CHOKE, time, channel, key, 0.0)
        }
        Event::ParamValue { time, param, value } => ClapEventAny {
            param: clap_event_param_value {
                header: header(std::mem::size_of::<clap_event_param_value>(), time, TYPE_PARAM_VALUE),
                param_id: param_id_for_index(param)?,
                cookie: std::ptr::null_mut(),
                note_id: -1,
                port_index: -1,
                channel: -1,
                key: -1,
                value,
            },
        },
        Event::Midi { time, port, data } => ClapEventAny {
            midi: clap_event_midi {
                header: header(std::mem::size_of::<clap_event_midi>(), time, TYPE_MIDI),
                port_index: port,
                data,
            },
        },
        // Gestures and modulation are not forwarded to CLAP plugins yet.
        Event::ParamMod { .. } | Event::ParamGestureBegin { .. } | Event::ParamGestureEnd { .. } => {
            return None;
        }
    })
}

/// Convert a CLAP event back to the wire representation.
///
/// # Safety
///
/// `header_ptr` must point at a complete, correctly-sized CLAP event.
pub unsafe fn from_clap(
    header_ptr: *const clap_event_header,
    param_index_for_id: impl Fn(u32) -> Option<u32>,
) -> Option<Event> {
    let head = unsafe { &*header_ptr };
    if head.space_id != CORE_SPACE_ID {
        return None;
    }
    unsafe {
        match head.type_ {
            TYPE_NOTE_ON | TYPE_NOTE_OFF | TYPE_NOTE_CHOKE => {
                let note = &*header_ptr.cast::<clap_event_note>();
                Some(match head.type_ {
                    TYPE_NOTE_ON => Event::NoteOn {
                        time: head.time,
                        channel: note.channel,
                        key: note.key,
                        velocity: note.velocity,
                    },
                    TYPE_NOTE_OFF => Event::NoteOff {
                        time: head.time,
                        channel: note.channel,
                        key: note.key,
                        velocity: note.velocity,
                    },
                    _ => Event::NoteChoke {
                        time: head.time,
                        channel: note.channel,
                        key: note.key,
                    },
                })
            }
            TYPE_PARAM_VALUE => {
                let param = &*header_ptr.cast::<clap_event_param_value>();
                Some(Event::ParamValue {
                    time: head.time,
                    param: param_index_for_id(param.param_id)?,
                    value: param.value,
                })
            }
            TYPE_MIDI => {
                let midi = &*header_ptr.cast::<clap_event_midi>();
                Some(Event::Midi {
                    time: head.time,
                    port: midi.port_index,
                    data: midi.data,
                })
            }
            _ => None,
        }
    }
}

// --- input event list shim -------------------------------------------------

pub struct InEventStore {
    pub events: Vec<ClapEventAny>,
}

unsafe extern "C" fn in_events_size(list: *const clap_input_events) -> u32 {
    let store = unsafe { &*(*list).ctx.cast::<InEventStore>() };
    store.events.len() as u32
}

unsafe extern "C" fn in_events_get(
    list: *const clap_input_events,
    index: u32,
) -> *const clap_event_header {
    let store = unsafe { &*(*list).ctx.cast::<InEventStore>() };
    store
        .events
        .get(index as usize)
        .map_or(std::ptr::null(), |event| std::ptr::from_ref(event).cast())
}

/// Build the `clap_input_events` vtable over `store`. `store` must outlive
/// the returned value's use.
pub fn input_events(store: &InEventStore) -> clap_input_events {
    clap_input_events {
        ctx: std::ptr::from_ref(store).cast_mut().cast::<c_void>(),
        size: Some(in_events_size),
        get: Some(in_events_get),
    }
}

// --- output event list shim ------------------------------------------------

/// Context for the output list: the destination ring plus the id->index
/// mapping for parameter events.
pub struct OutEventSink<'a> {
    pub list: &'a mut EventList,
    pub param_index_for_id: &'a dyn Fn(u32) -> Option<u32>,
}

unsafe extern "C" fn out_events_try_push(
    list: *const clap_output_events,
    event: *const clap_event_header,
) -> bool {
    if event.is_null() {
        return false;
    }
    let sink = unsafe { &mut *(*list).ctx.cast::<OutEventSink<'_>>() };
    if let Some(converted) = unsafe { from_clap(event, |id| (sink.param_index_for_id)(id)) } {
        // A full ring drops the surplus; report success either way so
        // plugins don't retry forever.
        sink.list.push(converted);
    }
    true
}

/// Build the `clap_output_events` vtable over `sink`.
pub fn output_events(sink: &mut OutEventSink<'_>) -> clap_output_events {
    clap_output_events {
        ctx: std::ptr::from_mut(sink).cast::<c_void>(),
        try_push: Some(out_events_try_push),
    }
}

// --- state stream shims ----------------------------------------------------

use clap_sys::stream::{clap_istream, clap_ostream};

unsafe extern "C" fn ostream_write(
    stream: *const clap_ostream,
    buffer: *const c_void,
    size: u64,
) -> i64 {
    let out = unsafe { &mut *(*stream).ctx.cast::<Vec<u8>>() };
    let bytes = unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), size as usize) };
    out.extend_from_slice(bytes);
    size as i64
}

/// Build a `clap_ostream` appending into `out`.
pub fn ostream(out: &mut Vec<u8>) -> clap_ostream {
    clap_ostream { ctx: std::ptr::from_mut(out).cast::<c_void>(), write: Some(ostream_write) }
}

pub struct ReadCursor<'a> {
    pub bytes: &'a [u8],
    pub pos: usize,
}

unsafe extern "C" fn istream_read(
    stream: *const clap_istream,
    buffer: *mut c_void,
    size: u64,
) -> i64 {
    let cursor = unsafe { &mut *(*stream).ctx.cast::<ReadCursor<'_>>() };
    let n = (size as usize).min(cursor.bytes.len() - cursor.pos);
    unsafe {
        std::ptr::copy_nonoverlapping(
            cursor.bytes[cursor.pos..].as_ptr(),
            buffer.cast::<u8>(),
            n,
        );
    }
    cursor.pos += n;
    n as i64
}

/// Build a `clap_istream` reading from `cursor`.
pub fn istream(cursor: &mut ReadCursor<'_>) -> clap_istream {
    clap_istream { ctx: std::ptr::from_mut(cursor).cast::<c_void>(), read: Some(istream_read) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_events_round_trip() {
        let original = Event::NoteOn { time: 12, channel: 1, key: 60, velocity: 0.75 };
        let clap = to_clap(&original, |_| None).unwrap();
        let back = unsafe { from_clap(std::ptr::from_ref(&clap).cast(), |_| None) }.unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_param_event_maps_index_to_id_and_back() {
        let original = Event::ParamValue { time: 0, param: 2, value: 0.5 };
        // Table index 2 <-> plugin param id 1002.
        let clap = to_clap(&original, |idx| (idx == 2).then_some(1002)).unwrap();
        let back = unsafe {
            from_clap(std::ptr::from_ref(&clap).cast(), |id| (id == 1002).then_some(2))
        }
        .unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_unmappable_param_event_is_dropped() {
        let original = Event::ParamValue { time: 0, param: 9, value: 0.5 };
        assert!(to_clap(&original, |_| None).is_none());
    }

    #[test]
    fn test_in_event_vtable_reads_store() {
        let store = InEventStore {
            events: vec![to_clap(&Event::Midi { time: 1, port: 0, data: [1, 2, 3] }, |_| None).unwrap()],
        };
        let list = input_events(&store);
        unsafe {
            assert_eq!(list.size.unwrap()(&raw const list), 1);
            let head = list.get.unwrap()(&raw const list, 0);
            assert_eq!((*head).type_, TYPE_MIDI);
            assert!(list.get.unwrap()(&raw const list, 5).is_null());
        }
    }

    #[test]
    fn test_stream_round_trip() {
        let mut saved = Vec::new();
        {
            let stream = ostream(&mut saved);
            let payload = [5u8, 6, 7];
            let written = unsafe {
                stream.write.unwrap()(&raw const stream, payload.as_ptr().cast(), 3)
            };
            assert_eq!(written, 3);
        }
        assert_eq!(saved, vec![5, 6, 7]);

        let mut cursor = ReadCursor { bytes: &saved, pos: 0 };
        let stream = istream(&mut cursor);
        let mut out = [0u8; 8];
        let read = unsafe {
            stream.read.unwrap()(&raw const stream, out.as_mut_ptr().cast(), 8)
        };
        assert_eq!(read, 3);
        assert_eq!(&out[..3], &[5, 6, 7]);
    }
}
