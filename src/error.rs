// src/error.rs - Error types for the pipeline framework
//
// Every fallible operation on buffers, ports, devices and pipes returns
// `crate::error::Result`. Errors are local, synchronous values; nothing in
// the crate panics across the public API boundary. Peer disconnection on
// the socket transport is deliberately NOT an error: it is delivered as a
// sentinel buffer on the filled queue (see `io::socket`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Operation requested outside its valid lifecycle state
    /// (e.g. `send_command(Start)` before `initialize`, double `initialize`).
    #[error("invalid state: cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// Connecting a port that already has a peer.
    #[error("port '{0}' is already connected")]
    AlreadyConnected(String),

    /// Disconnecting ports that are not connected to each other.
    #[error("ports '{input}' and '{output}' are not connected")]
    NotConnected { input: String, output: String },

    /// Pushing on an output port with no connected peer.
    #[error("port '{0}' has no connected peer")]
    NoPeer(String),

    /// Registering a device under a (kind, name) key that is taken.
    #[error("device {kind} '{name}' is already registered")]
    DuplicateDevice { kind: &'static str, name: String },

    /// Lookup of a device the pipe does not own.
    #[error("device {kind} not found")]
    DeviceNotFound { kind: &'static str },

    /// Removing a device that is still initialized or linked.
    #[error("device '{0}' is still initialized or connected")]
    DeviceBusy(String),

    /// A device has no port at the requested index.
    #[error("device '{device}' has no port at index {index}")]
    NoSuchPort { device: String, index: usize },

    /// Writing more bytes than a buffer can hold.
    #[error("write of {len} bytes exceeds buffer capacity of {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },

    /// Bounded acquire gave up before a buffer became free.
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// Inbound socket frame larger than the receiving pool's buffers.
    #[error("frame of {len} bytes exceeds receive buffer capacity of {capacity}")]
    FrameTooLarge { len: usize, capacity: usize },

    /// Device kind known to the framework but not constructible here.
    #[error("operation not implemented")]
    NotImplemented,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
