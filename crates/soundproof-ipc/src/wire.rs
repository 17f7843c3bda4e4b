//! Length-prefixed tagged-union framing over the byte rings.
//!
//! Frame: `[u64 frame_len][u64 tag][payload...]`, host-endian. `frame_len`
//! counts everything after itself. Payload fields are POD scalars,
//! length-prefixed UTF-8 strings, and length-prefixed byte blobs.
//!
//! Both the sender and the receiver tolerate arbitrary fragmentation: a
//! frame may cross any number of partial ring transfers in either
//! direction. A slow reader fills the writer's ring; the sender then simply
//! retains its unsent tail until the next poll.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Upper bound on a single frame. Anything larger is treated as stream
/// corruption rather than an allocation request.
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Wire-format errors
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated payload")]
    Truncated,

    #[error("unknown message tag {0}")]
    BadTag(u64),

    #[error("payload string is not UTF-8")]
    BadUtf8,

    #[error("unreasonable frame length {0}")]
    BadFrameLen(u64),

    #[error("bad enum value {value} for {what}")]
    BadEnum { what: &'static str, value: u64 },

    #[error("{0} bytes left over after decoding payload")]
    TrailingBytes(usize),
}

/// A message that can cross the transport.
pub trait WireMsg: Sized {
    fn tag(&self) -> u64;
    fn encode_payload(&self, out: &mut Vec<u8>);
    fn decode(tag: u64, r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

// --- payload primitives ----------------------------------------------------

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

pub fn put_str(out: &mut Vec<u8>, v: &str) {
    put_u64(out, v.len() as u64);
    out.extend_from_slice(v.as_bytes());
}

pub fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u64(out, v.len() as u64);
    out.extend_from_slice(v);
}

/// Cursor over one frame's payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_ne_bytes(self.take(2)?.try_into().expect("sized take")))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().expect("sized take")))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().expect("sized take")))
    }

    pub fn i16(&mut self) -> Result<i16, WireError> {
        Ok(i16::from_ne_bytes(self.take(2)?.try_into().expect("sized take")))
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_ne_bytes(self.take(8)?.try_into().expect("sized take")))
    }

    pub fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_ne_bytes(self.take(8)?.try_into().expect("sized take")))
    }

    pub fn str(&mut self) -> Result<String, WireError> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn byte_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        Ok(self.take(N)?.try_into().expect("sized take"))
    }
}

// --- sender / receiver -----------------------------------------------------

struct SenderIo {
    scratch: Vec<u8>,
    bytes_remaining: usize,
}

/// Serializes queued messages into a ring via a caller-supplied write
/// function. `enqueue` may be called from any thread; `send` is driven by
/// the owning poller.
pub struct Sender<T> {
    queue: Mutex<VecDeque<T>>,
    io: Mutex<SenderIo>,
}

impl<T: WireMsg> Sender<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            io: Mutex::new(SenderIo { scratch: Vec::new(), bytes_remaining: 0 }),
        }
    }

    pub fn enqueue(&self, msg: T) {
        self.queue.lock().push_back(msg);
    }

    /// Push pending bytes, then serialize and push queued messages, until
    /// either everything is flushed or the ring refuses more.
    pub fn send(&self, mut write: impl FnMut(&[u8]) -> usize) {
        let mut io = self.io.lock();
        loop {
            if io.bytes_remaining > 0 {
                let offset = io.scratch.len() - io.bytes_remaining;
                let sent = write(&io.scratch[offset..]);
                io.bytes_remaining -= sent;
                if io.bytes_remaining > 0 {
                    return;
                }
            }
            let Some(msg) = self.queue.lock().pop_front() else {
                return;
            };
            io.scratch.clear();
            io.scratch.extend_from_slice(&[0u8; 8]); // frame length placeholder
            put_u64(&mut io.scratch, msg.tag());
            msg.encode_payload(&mut io.scratch);
            let frame_len = (io.scratch.len() - 8) as u64;
            io.scratch[..8].copy_from_slice(&frame_len.to_ne_bytes());
            io.bytes_remaining = io.scratch.len();
        }
    }

    /// Whether any message bytes are still waiting to go out.
    pub fn has_pending(&self) -> bool {
        self.io.lock().bytes_remaining > 0 || !self.queue.lock().is_empty()
    }

    /// Drop queued messages and any half-sent frame. Used when the peer is
    /// replaced and stream state must start from scratch.
    pub fn reset(&self) {
        self.queue.lock().clear();
        let mut io = self.io.lock();
        io.scratch.clear();
        io.bytes_remaining = 0;
    }
}

impl<T: WireMsg> Default for Sender<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum RecvPhase {
    /// Collecting the 8-byte frame length.
    FrameLen,
    /// Collecting `frame_len` payload bytes (tag included).
    Payload,
}

struct RecvState {
    buf: Vec<u8>,
    got: usize,
    phase: RecvPhase,
}

/// Reassembles frames from a ring via a caller-supplied read function and
/// decodes them in arrival order.
pub struct Receiver<T> {
    state: Mutex<RecvState>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: WireMsg> Receiver<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecvState {
                buf: vec![0u8; 8],
                got: 0,
                phase: RecvPhase::FrameLen,
            }),
            _marker: std::marker::PhantomData,
        }
    }

    /// Drain as many complete messages as the ring currently yields.
    pub fn receive(
        &self,
        mut read: impl FnMut(&mut [u8]) -> usize,
    ) -> Result<Vec<T>, WireError> {
        let mut state = self.state.lock();
        let mut msgs = Vec::new();
        loop {
            if state.got < state.buf.len() {
                let got = state.got;
                let n = read(&mut state.buf[got..]);
                state.got += n;
                if state.got < state.buf.len() {
                    return Ok(msgs);
                }
            }
            match state.phase {
                RecvPhase::FrameLen => {
                    let frame_len =
                        u64::from_ne_bytes(state.buf[..8].try_into().expect("sized header"));
                    if frame_len < 8 || frame_len > MAX_FRAME_LEN {
                        return Err(WireError::BadFrameLen(frame_len));
                    }
                    state.buf.resize(frame_len as usize, 0);
                    state.got = 0;
                    state.phase = RecvPhase::Payload;
                }
                RecvPhase::Payload => {
                    let tag = u64::from_ne_bytes(state.buf[..8].try_into().expect("sized tag"));
                    let mut reader = WireReader::new(&state.buf[8..]);
                    let msg = T::decode(tag, &mut reader)?;
                    if reader.remaining() > 0 {
                        return Err(WireError::TrailingBytes(reader.remaining()));
                    }
                    msgs.push(msg);
                    state.buf.resize(8, 0);
                    state.got = 0;
                    state.phase = RecvPhase::FrameLen;
                }
            }
        }
    }
}

impl<T: WireMsg> Default for Receiver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WireMsg> Receiver<T> {
    /// Forget any partially-assembled frame.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buf = vec![0u8; 8];
        state.got = 0;
        state.phase = RecvPhase::FrameLen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestMsg {
        Ping,
        Named { id: i64, name: String },
        Blob { data: Vec<u8> },
    }

    impl WireMsg for TestMsg {
        fn tag(&self) -> u64 {
            match self {
                Self::Ping => 0,
                Self::Named { .. } => 1,
                Self::Blob { .. } => 2,
            }
        }

        fn encode_payload(&self, out: &mut Vec<u8>) {
            match self {
                Self::Ping => {}
                Self::Named { id, name } => {
                    put_i64(out, *id);
                    put_str(out, name);
                }
                Self::Blob { data } => put_bytes(out, data),
            }
        }

        fn decode(tag: u64, r: &mut WireReader<'_>) -> Result<Self, WireError> {
            match tag {
                0 => Ok(Self::Ping),
                1 => Ok(Self::Named { id: r.i64()?, name: r.str()? }),
                2 => Ok(Self::Blob { data: r.bytes()? }),
                other => Err(WireError::BadTag(other)),
            }
        }
    }

    /// In-memory stand-in for a byte ring with a tiny capacity, to force
    /// fragmentation.
    struct TinyRing {
        data: Vec<u8>,
        cap: usize,
    }

    impl TinyRing {
        fn new(cap: usize) -> Self {
            Self { data: Vec::new(), cap }
        }

        fn write(&mut self, src: &[u8]) -> usize {
            let n = src.len().min(self.cap - self.data.len());
            self.data.extend_from_slice(&src[..n]);
            n
        }

        fn read(&mut self, dst: &mut [u8]) -> usize {
            let n = dst.len().min(self.data.len());
            dst[..n].copy_from_slice(&self.data[..n]);
            self.data.drain(..n);
            n
        }
    }

    #[test]
    fn test_round_trip_through_fragmented_ring() {
        let sender = Sender::new();
        let receiver = Receiver::new();
        let mut ring = TinyRing::new(7); // smaller than any frame

        let msgs = vec![
            TestMsg::Ping,
            TestMsg::Named { id: -3, name: "distrho".to_string() },
            TestMsg::Blob { data: vec![1, 2, 3, 4, 5] },
        ];
        for m in &msgs {
            sender.enqueue(m.clone());
        }

        let mut received = Vec::new();
        // Each poll moves at most 7 bytes; loop until everything arrives.
        for _ in 0..200 {
            sender.send(|bytes| ring.write(bytes));
            received.extend(receiver.receive(|buf| ring.read(buf)).unwrap());
            if received.len() == msgs.len() {
                break;
            }
        }
        assert_eq!(received, msgs);
        assert!(!sender.has_pending());
    }

    #[test]
    fn test_backpressure_retains_unsent_tail() {
        let sender = Sender::new();
        sender.enqueue(TestMsg::Blob { data: vec![9; 64] });
        // Ring refuses everything: nothing is lost.
        sender.send(|_| 0);
        assert!(sender.has_pending());
        // Now let it through.
        let mut ring = TinyRing::new(1024);
        sender.send(|bytes| ring.write(bytes));
        assert!(!sender.has_pending());
        let receiver = Receiver::<TestMsg>::new();
        let got = receiver.receive(|buf| ring.read(buf)).unwrap();
        assert_eq!(got, vec![TestMsg::Blob { data: vec![9; 64] }]);
    }

    #[test]
    fn test_bad_tag_is_an_error() {
        let mut out = vec![0u8; 8];
        put_u64(&mut out, 77); // tag that doesn't exist
        let frame_len = (out.len() - 8) as u64;
        out[..8].copy_from_slice(&frame_len.to_ne_bytes());

        let mut cursor = out.as_slice();
        let receiver = Receiver::<TestMsg>::new();
        let result = receiver.receive(|buf| {
            let n = buf.len().min(cursor.len());
            buf[..n].copy_from_slice(&cursor[..n]);
            cursor = &cursor[n..];
            n
        });
        assert!(matches!(result, Err(WireError::BadTag(77))));
    }

    #[test]
    fn test_fifo_order_is_preserved() {
        let sender = Sender::new();
        let receiver = Receiver::new();
        let mut ring = TinyRing::new(4096);
        for i in 0..50 {
            sender.enqueue(TestMsg::Named { id: i, name: format!("m{i}") });
        }
        sender.send(|bytes| ring.write(bytes));
        let got = receiver.receive(|buf| ring.read(buf)).unwrap();
        assert_eq!(got.len(), 50);
        for (i, msg) in got.iter().enumerate() {
            assert_eq!(*msg, TestMsg::Named { id: i as i64, name: format!("m{i}") });
        }
    }
}
