// src/core/device.rs - The Device contract, lifecycle state machine and
// worker-thread plumbing shared by every concrete device.
//
// Lifecycle: Uninitialized -> Initialized -> Running -> Stopped ->
// Uninitialized. Ports exist only between initialize and uninitialize;
// Start is valid only once per initialize cycle; Stop joins the worker
// before returning, so no port activity happens after it returns.

use crate::core::port::{InputPort, OutputPort};
use crate::error::{Error, Result};
use log::warn;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default port index used by the device-level connect sugar.
pub const DEFAULT_PORT: usize = 0;

/// How often worker loops re-check their stop flag while blocked.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Every device kind the framework knows. Only the file and socket kinds
/// are constructible in this crate; the capture/encode/processing kinds
/// are external collaborators implementing the same [`Device`] contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Capture,
    AudioProcessor,
    VideoEncoder,
    Flac,
    Curl,
    TextProcessor,
    CommandProcessor,
    FileSink,
    FileSrc,
    SocketReceiver,
    SocketTransmitter,
    VideoTunnel,
    Demux,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Capture => "capture",
            DeviceKind::AudioProcessor => "audio-processor",
            DeviceKind::VideoEncoder => "video-encoder",
            DeviceKind::Flac => "flac",
            DeviceKind::Curl => "curl",
            DeviceKind::TextProcessor => "text-processor",
            DeviceKind::CommandProcessor => "command-processor",
            DeviceKind::FileSink => "file-sink",
            DeviceKind::FileSrc => "file-src",
            DeviceKind::SocketReceiver => "socket-receiver",
            DeviceKind::SocketTransmitter => "socket-transmitter",
            DeviceKind::VideoTunnel => "video-tunnel",
            DeviceKind::Demux => "demux",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

impl DeviceState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::Initialized => "initialized",
            DeviceState::Running => "running",
            DeviceState::Stopped => "stopped",
        }
    }
}

/// Lifecycle commands broadcast by a pipe or sent directly by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

/// Asynchronous notifications delivered to a device without blocking the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Upstream source is exhausted.
    EndOfStream,
    /// A transport peer went away.
    Disconnected,
}

/// Device-specific configuration. Construction-time parameters must be set
/// before `initialize` for them to take effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    /// File path for file devices.
    pub path: Option<PathBuf>,
    /// Remote or listen host for socket devices.
    pub host: Option<String>,
    /// Remote or listen port for socket devices.
    pub port: Option<u16>,
    /// Payload chunk size for devices that segment a byte stream.
    pub chunk_size: Option<usize>,
}

impl Parameters {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Parameters {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Parameters {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }
}

/// Polymorphic unit of pipeline work.
///
/// A device owns zero or more ports, an explicit lifecycle and, while
/// Running, exactly one worker thread moving data between its ports.
/// Devices communicate solely through port queues; there is no global
/// scheduler.
pub trait Device: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    fn state(&self) -> DeviceState;

    /// Allocate ports and internal resources. Fails if called twice
    /// without an intervening [`uninitialize`](Device::uninitialize), and
    /// on resource failure leaves the device cleanly Uninitialized.
    fn initialize(&mut self) -> Result<()>;

    /// Destroy ports and internal resources. Idempotent; fails only while
    /// Running.
    fn uninitialize(&mut self) -> Result<()>;

    /// Input port at `index`, or `None` if the device has no such port.
    /// Ports are only valid between initialize and uninitialize.
    fn input(&self, index: usize) -> Option<Arc<InputPort>> {
        let _ = index;
        None
    }

    /// Output port at `index`, or `None` if the device has no such port.
    fn output(&self, index: usize) -> Option<Arc<OutputPort>> {
        let _ = index;
        None
    }

    /// Drive the lifecycle: `Start` spawns the worker (valid once per
    /// initialize cycle), `Stop` signals it and joins it before returning.
    fn send_command(&mut self, command: Command) -> Result<()>;

    /// Deliver an asynchronous event. The default implementation ignores
    /// it.
    fn notify(&mut self, event: Event) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Pre-roll setup distinct from initialize (e.g. priming buffers).
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Return a started-then-stopped device to a state where
    /// `initialize` can run again without residual state.
    fn reset(&mut self) -> Result<()> {
        if self.state() == DeviceState::Running {
            return Err(Error::InvalidState {
                op: "reset",
                state: DeviceState::Running.as_str(),
            });
        }
        self.uninitialize()
    }

    fn set_parameters(&mut self, parameters: &Parameters) -> Result<()> {
        let _ = parameters;
        Err(Error::NotImplemented)
    }

    fn get_parameters(&self) -> Result<Parameters> {
        Err(Error::NotImplemented)
    }
}

/// Guard helper: error unless the device is in `expected` state.
pub(crate) fn require_state(
    current: DeviceState,
    expected: DeviceState,
    op: &'static str,
) -> Result<()> {
    if current != expected {
        return Err(Error::InvalidState {
            op,
            state: current.as_str(),
        });
    }
    Ok(())
}

/// One worker thread plus the stop flag it polls.
///
/// Spawned with a named `std::thread::Builder`; `stop` flips the flag and
/// joins, guaranteeing the loop has fully exited before it returns. Workers
/// must bound every wait (pool acquire, queue pop, socket read) so the flag
/// is observed within roughly one [`POLL_INTERVAL`].
pub(crate) struct WorkerControl {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerControl {
    pub(crate) fn spawn<F>(thread_name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || body(flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("device worker panicked");
            }
        }
    }
}

impl Drop for WorkerControl {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convenience for worker loops.
pub(crate) fn should_stop(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stop_joins() {
        let mut worker = WorkerControl::spawn("test-worker", |stop| {
            while !should_stop(&stop) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("Failed to spawn");
        worker.stop();
        // Second stop is a no-op.
        worker.stop();
    }

    #[test]
    fn test_require_state() {
        assert!(require_state(DeviceState::Initialized, DeviceState::Initialized, "start").is_ok());
        let err = require_state(DeviceState::Uninitialized, DeviceState::Initialized, "start");
        assert!(matches!(err, Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_parameters_builders() {
        let p = Parameters::path("/tmp/out.bin");
        assert_eq!(p.path.as_deref(), Some(std::path::Path::new("/tmp/out.bin")));
        let s = Parameters::socket("127.0.0.1", 9000);
        assert_eq!(s.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(s.port, Some(9000));
    }
}
