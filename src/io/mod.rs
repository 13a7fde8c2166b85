// src/io/mod.rs - Concrete device implementations and the standard factory

pub mod file;
pub mod socket;

use crate::core::device::{Device, DeviceKind, Parameters};
use crate::core::pipe::Pipe;
use crate::error::{Error, Result};

use file::{FileSink, FileSrc};
use socket::{SocketReceiver, SocketTransmitter};

fn standard_factory(kind: DeviceKind, name: &str, parameters: &Parameters) -> Result<Box<dyn Device>> {
    match kind {
        DeviceKind::FileSrc => Ok(Box::new(FileSrc::new(name, parameters))),
        DeviceKind::FileSink => Ok(Box::new(FileSink::new(name, parameters))),
        DeviceKind::SocketReceiver => Ok(Box::new(SocketReceiver::new(name, parameters))),
        DeviceKind::SocketTransmitter => Ok(Box::new(SocketTransmitter::new(name, parameters))),
        // Capture, encoding and processing kinds live outside this crate.
        _ => Err(Error::NotImplemented),
    }
}

/// A [`Pipe`] wired with the factory for every device kind this crate
/// implements: file source/sink and the socket pair.
pub fn av_pipe(name: impl Into<String>) -> Pipe {
    Pipe::with_factory(name, standard_factory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_covers_io_kinds() {
        let mut pipe = av_pipe("av pipe");
        let file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        pipe.add_device(
            DeviceKind::FileSrc,
            "reader",
            Parameters::path(file.path()),
        )
        .expect("Failed to add file source");
        pipe.add_device(
            DeviceKind::SocketReceiver,
            "listener",
            Parameters::socket("127.0.0.1", 0),
        )
        .expect("Failed to add receiver");
        assert!(matches!(
            pipe.add_device(DeviceKind::Capture, "cap", Parameters::default()),
            Err(Error::NotImplemented)
        ));
    }
}
