//! Building blocks for screencasting pipelines: pooled buffers, connected
//! ports, polymorphic devices and the pipe that owns and drives them.
//!
//! # Architecture
//!
//! - `Buffer`/`BufferPool`: fixed-size reusable payload cells; the bounded
//!   pool behind each port is the pipeline's flow control
//! - `InputPort`/`OutputPort`: connected pairs moving buffers over a FIFO
//!   filled queue with no loss or reordering
//! - `Device`: one lifecycle, zero or more ports, one worker thread while
//!   running; no global scheduler
//! - `Pipe`: owns devices, tracks links and broadcasts lifecycle commands
//!   in dependency order
//! - `io`: the concrete file and socket devices, plus [`av_pipe`] which
//!   wires a `Pipe` with the factory for all of them
//!
//! # Example
//!
//! ```no_run
//! use castpipe::{av_pipe, Command, Device, DeviceKind, Parameters};
//!
//! fn main() -> castpipe::Result<()> {
//!     let mut pipe = av_pipe("relay");
//!     pipe.add_device(DeviceKind::FileSrc, "reader", Parameters::path("in.ts"))?;
//!     pipe.add_device(
//!         DeviceKind::SocketTransmitter,
//!         "uplink",
//!         Parameters::socket("192.168.1.20", 9000),
//!     )?;
//!     pipe.initialize()?;
//!
//!     let output = pipe.find_device(DeviceKind::FileSrc).unwrap().output(0).unwrap();
//!     let input = pipe
//!         .find_device(DeviceKind::SocketTransmitter)
//!         .unwrap()
//!         .input(0)
//!         .unwrap();
//!     pipe.connect_ports(&input, &output)?;
//!
//!     pipe.send_command(Command::Start)?;
//!     // ... stream until done ...
//!     pipe.send_command(Command::Stop)?;
//!     pipe.uninitialize()?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod error;
pub mod io;

pub use crate::core::buffer::{
    Buffer, BufferPool, Tag, DEFAULT_BUFFER_CAPACITY, DEFAULT_POOL_CAPACITY,
};
pub use crate::core::device::{
    Command, Device, DeviceKind, DeviceState, Event, Parameters, DEFAULT_PORT,
};
pub use crate::core::pipe::{DeviceFactory, Pipe};
pub use crate::core::port::{connect, disconnect, InputPort, OutputPort};
pub use crate::error::{Error, Result};
pub use crate::io::av_pipe;
pub use crate::io::file::{FileSink, FileSrc};
pub use crate::io::socket::{
    SocketInput, SocketOutput, SocketReceiver, SocketTransmitter, DISCONNECT_SENTINEL,
};
