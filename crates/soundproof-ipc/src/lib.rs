//! Cross-process plumbing: shared-memory segments, the group signaling
//! primitive, message framing, the wire message set, and the slot buffer
//! used to correlate async replies.
//!
//! Everything in this crate assumes that all participating processes were
//! built from the same workspace and run on the same machine; layouts are
//! `#[repr(C)]` and the wire format is host-endian.

pub mod layout;
pub mod msg;
pub mod ring;
pub mod shm;
pub mod signal;
pub mod slot;
pub mod wire;

/// IPC-related errors
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("shared memory error: {0}")]
    Shm(String),

    #[error("signaling error: {0}")]
    Signal(String),

    #[error(transparent)]
    Wire(#[from] wire::WireError),

    #[error("capacity exceeded: {0}")]
    Capacity(String),
}
