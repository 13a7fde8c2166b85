// src/io/file.rs - File source and sink devices
//
// FileSrc reads a file and publishes it as a tagged buffer stream: one
// Start marker, the payload in chunks, one Eos marker at end of file.
// FileSink drains its input queue to a file, flushing on End/Eos. Both
// open their file during initialize so a bad path fails there, not in
// the worker.

use crate::core::buffer::{Buffer, BufferPool, Tag, DEFAULT_BUFFER_CAPACITY, DEFAULT_POOL_CAPACITY};
use crate::core::device::{
    require_state, should_stop, Command, Device, DeviceKind, DeviceState, Parameters,
    WorkerControl, DEFAULT_PORT, POLL_INTERVAL,
};
use crate::core::port::{InputPort, OutputPort};
use crate::error::{Error, Result};
use log::{debug, error, info};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn missing_path(device: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("device '{device}' has no path parameter"),
    ))
}

/// Streams a file's contents out of its single output port.
pub struct FileSrc {
    name: String,
    state: DeviceState,
    path: Option<PathBuf>,
    chunk_size: usize,
    file: Option<File>,
    output: Option<Arc<OutputPort>>,
    worker: Option<WorkerControl>,
}

impl FileSrc {
    pub fn new(name: impl Into<String>, parameters: &Parameters) -> Self {
        Self {
            name: name.into(),
            state: DeviceState::Uninitialized,
            path: parameters.path.clone(),
            chunk_size: parameters.chunk_size.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            file: None,
            output: None,
            worker: None,
        }
    }

    fn pump(output: &OutputPort, file: &mut File, chunk_size: usize, stop: &AtomicBool) {
        let mut scratch = vec![0u8; chunk_size];
        let mut started = false;
        while !should_stop(stop) {
            let Ok(mut buffer) = output.get_buffer_timeout(POLL_INTERVAL) else {
                continue;
            };
            if !started {
                buffer.set_tag(Tag::Start);
                started = true;
                if let Err(e) = output.push_buffer(buffer) {
                    debug!("file source '{}': dropped start marker: {e}", output.name());
                }
                continue;
            }
            let want = chunk_size.min(buffer.capacity());
            match file.read(&mut scratch[..want]) {
                Ok(0) => {
                    buffer.set_tag(Tag::Eos);
                    if let Err(e) = output.push_buffer(buffer) {
                        debug!("file source '{}': dropped eos marker: {e}", output.name());
                    }
                    break;
                }
                Ok(n) => {
                    if let Err(e) = buffer.write_data(&scratch[..n]) {
                        error!("file source '{}': chunk store failed: {e}", output.name());
                        break;
                    }
                    if let Err(e) = output.push_buffer(buffer) {
                        debug!("file source '{}': dropped chunk: {e}", output.name());
                    }
                }
                Err(e) => {
                    error!("file source '{}': read failed: {e}", output.name());
                    break;
                }
            }
        }
        // Exhausted or failed; idle until stopped so the port stays live.
        while !should_stop(stop) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Device for FileSrc {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::FileSrc
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn initialize(&mut self) -> Result<()> {
        require_state(self.state, DeviceState::Uninitialized, "initialize")?;
        let path = self.path.as_ref().ok_or_else(|| missing_path(&self.name))?;
        let file = File::open(path)?;
        let pool = BufferPool::new(DEFAULT_POOL_CAPACITY, self.chunk_size);
        self.output = Some(OutputPort::with_pool(format!("{} out", self.name), pool));
        self.file = Some(file);
        self.state = DeviceState::Initialized;
        info!("file source '{}': opened {}", self.name, path.display());
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        if self.state == DeviceState::Running {
            return Err(Error::InvalidState {
                op: "uninitialize",
                state: DeviceState::Running.as_str(),
            });
        }
        self.worker = None;
        self.file = None;
        self.output = None;
        self.state = DeviceState::Uninitialized;
        Ok(())
    }

    fn output(&self, index: usize) -> Option<Arc<OutputPort>> {
        (index == DEFAULT_PORT)
            .then(|| self.output.clone())
            .flatten()
    }

    fn send_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start => {
                require_state(self.state, DeviceState::Initialized, "start")?;
                let output = Arc::clone(self.output.as_ref().expect("initialized without port"));
                let mut file = self.file.take().expect("initialized without file");
                let chunk_size = self.chunk_size;
                output.set_streaming(true);
                let worker =
                    WorkerControl::spawn(&format!("file-src-{}", self.name), move |stop| {
                        Self::pump(&output, &mut file, chunk_size, &stop);
                    });
                match worker {
                    Ok(worker) => {
                        self.worker = Some(worker);
                        self.state = DeviceState::Running;
                        Ok(())
                    }
                    Err(e) => {
                        self.output
                            .as_ref()
                            .expect("initialized without port")
                            .set_streaming(false);
                        Err(e)
                    }
                }
            }
            Command::Stop => {
                if self.state == DeviceState::Uninitialized {
                    return Err(Error::InvalidState {
                        op: "stop",
                        state: DeviceState::Uninitialized.as_str(),
                    });
                }
                if let Some(mut worker) = self.worker.take() {
                    worker.stop();
                }
                if let Some(output) = &self.output {
                    output.set_streaming(false);
                }
                if self.state == DeviceState::Running {
                    self.state = DeviceState::Stopped;
                }
                Ok(())
            }
        }
    }

    fn set_parameters(&mut self, parameters: &Parameters) -> Result<()> {
        require_state(self.state, DeviceState::Uninitialized, "set parameters")?;
        if let Some(path) = &parameters.path {
            self.path = Some(path.clone());
        }
        if let Some(chunk_size) = parameters.chunk_size {
            self.chunk_size = chunk_size;
        }
        Ok(())
    }

    fn get_parameters(&self) -> Result<Parameters> {
        Ok(Parameters {
            path: self.path.clone(),
            chunk_size: Some(self.chunk_size),
            ..Default::default()
        })
    }
}

/// Writes every buffer arriving on its input port to a file.
pub struct FileSink {
    name: String,
    state: DeviceState,
    path: Option<PathBuf>,
    file: Option<File>,
    input: Option<Arc<InputPort>>,
    worker: Option<WorkerControl>,
}

impl FileSink {
    pub fn new(name: impl Into<String>, parameters: &Parameters) -> Self {
        Self {
            name: name.into(),
            state: DeviceState::Uninitialized,
            path: parameters.path.clone(),
            file: None,
            input: None,
            worker: None,
        }
    }

    fn write_one(input: &InputPort, file: &mut File, buffer: &Buffer) {
        // Break carries control payload (e.g. the socket disconnect
        // sentinel), never media bytes.
        if buffer.tag() == Tag::Break {
            return;
        }
        if !buffer.is_empty() {
            if let Err(e) = file.write_all(buffer.data()) {
                error!("file sink '{}': write failed: {e}", input.name());
            }
        }
        if matches!(buffer.tag(), Tag::End | Tag::Eos) {
            let _ = file.flush();
        }
    }

    fn drain(input: &InputPort, file: &mut File, stop: &AtomicBool) {
        while !should_stop(stop) {
            let Some(buffer) = input.wait_filled(POLL_INTERVAL) else {
                continue;
            };
            Self::write_one(input, file, &buffer);
        }
        // Flush whatever is still queued before the worker exits, so a
        // stop never loses data already handed to this device.
        while let Some(buffer) = input.get_filled_buffer() {
            Self::write_one(input, file, &buffer);
        }
        let _ = file.flush();
    }
}

impl Device for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::FileSink
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn initialize(&mut self) -> Result<()> {
        require_state(self.state, DeviceState::Uninitialized, "initialize")?;
        let path = self.path.as_ref().ok_or_else(|| missing_path(&self.name))?;
        let file = File::create(path)?;
        self.input = Some(InputPort::new(format!("{} in", self.name)));
        self.file = Some(file);
        self.state = DeviceState::Initialized;
        info!("file sink '{}': created {}", self.name, path.display());
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        if self.state == DeviceState::Running {
            return Err(Error::InvalidState {
                op: "uninitialize",
                state: DeviceState::Running.as_str(),
            });
        }
        self.worker = None;
        self.file = None;
        self.input = None;
        self.state = DeviceState::Uninitialized;
        Ok(())
    }

    fn input(&self, index: usize) -> Option<Arc<InputPort>> {
        (index == DEFAULT_PORT)
            .then(|| self.input.clone())
            .flatten()
    }

    fn send_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start => {
                require_state(self.state, DeviceState::Initialized, "start")?;
                let input = Arc::clone(self.input.as_ref().expect("initialized without port"));
                let mut file = self.file.take().expect("initialized without file");
                input.set_streaming(true);
                let worker =
                    WorkerControl::spawn(&format!("file-sink-{}", self.name), move |stop| {
                        Self::drain(&input, &mut file, &stop);
                    });
                match worker {
                    Ok(worker) => {
                        self.worker = Some(worker);
                        self.state = DeviceState::Running;
                        Ok(())
                    }
                    Err(e) => {
                        self.input
                            .as_ref()
                            .expect("initialized without port")
                            .set_streaming(false);
                        Err(e)
                    }
                }
            }
            Command::Stop => {
                if self.state == DeviceState::Uninitialized {
                    return Err(Error::InvalidState {
                        op: "stop",
                        state: DeviceState::Uninitialized.as_str(),
                    });
                }
                if let Some(mut worker) = self.worker.take() {
                    worker.stop();
                }
                if let Some(input) = &self.input {
                    input.set_streaming(false);
                }
                if self.state == DeviceState::Running {
                    self.state = DeviceState::Stopped;
                }
                Ok(())
            }
        }
    }

    fn set_parameters(&mut self, parameters: &Parameters) -> Result<()> {
        require_state(self.state, DeviceState::Uninitialized, "set parameters")?;
        if let Some(path) = &parameters.path {
            self.path = Some(path.clone());
        }
        Ok(())
    }

    fn get_parameters(&self) -> Result<Parameters> {
        Ok(Parameters {
            path: self.path.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    #[test]
    fn test_file_src_requires_path() {
        let mut src = FileSrc::new("src", &Parameters::default());
        assert!(src.initialize().is_err());
        assert_eq!(src.state(), DeviceState::Uninitialized);
    }

    #[test]
    fn test_file_src_missing_file_fails_initialize() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let mut src = FileSrc::new("src", &Parameters::path(dir.path().join("absent.bin")));
        assert!(matches!(src.initialize(), Err(Error::Io(_))));
        assert_eq!(src.state(), DeviceState::Uninitialized);
        assert!(src.output(0).is_none());
    }

    #[test]
    fn test_file_src_streams_tagged_chunks() {
        let mut source_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| (i as u8).to_be_bytes()).collect();
        source_file
            .write_all(&payload)
            .expect("Failed to write payload");
        source_file.flush().expect("Failed to flush");

        let mut params = Parameters::path(source_file.path());
        params.chunk_size = Some(512);
        let mut src = FileSrc::new("src", &params);
        src.initialize().expect("Failed to initialize");

        let input = InputPort::new("probe");
        let output = src.output(DEFAULT_PORT).expect("no output port");
        crate::core::port::connect(&input, &output).expect("Failed to connect");

        src.send_command(Command::Start).expect("Failed to start");

        let mut collected = Vec::new();
        let mut saw_start = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "no eos before deadline");
            let Some(buffer) = input.wait_filled(Duration::from_millis(50)) else {
                continue;
            };
            match buffer.tag() {
                Tag::Start => {
                    assert!(!saw_start, "duplicate start marker");
                    assert!(collected.is_empty(), "data before start marker");
                    saw_start = true;
                }
                Tag::Eos => {
                    input.recycle_buffer(buffer).expect("Failed to recycle");
                    break;
                }
                _ => collected.extend_from_slice(buffer.data()),
            }
            input.recycle_buffer(buffer).expect("Failed to recycle");
        }
        assert!(saw_start);
        assert_eq!(collected, payload);

        src.send_command(Command::Stop).expect("Failed to stop");
        src.uninitialize().expect("Failed to uninitialize");
    }

    #[test]
    fn test_file_src_start_without_initialize_fails() {
        let mut src = FileSrc::new("src", &Parameters::default());
        assert!(matches!(
            src.send_command(Command::Start),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_file_sink_writes_and_flushes() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let path = dir.path().join("out.bin");
        let mut sink = FileSink::new("sink", &Parameters::path(&path));
        sink.initialize().expect("Failed to initialize");

        let output = OutputPort::new("probe");
        let input = sink.input(DEFAULT_PORT).expect("no input port");
        crate::core::port::connect(&input, &output).expect("Failed to connect");

        sink.send_command(Command::Start).expect("Failed to start");

        let mut start = output.get_buffer();
        start.set_tag(Tag::Start);
        output.push_buffer(start).expect("Failed to push");
        let mut data = output.get_buffer();
        data.write_data(b"casting payload").expect("Failed to write");
        output.push_buffer(data).expect("Failed to push");
        let mut eos = output.get_buffer();
        eos.set_tag(Tag::Eos);
        output.push_buffer(eos).expect("Failed to push");

        sink.send_command(Command::Stop).expect("Failed to stop");
        let written = std::fs::read(&path).expect("Failed to read output file");
        assert_eq!(written, b"casting payload");

        sink.uninitialize().expect("Failed to uninitialize");
        assert!(sink.input(DEFAULT_PORT).is_none());
    }

    #[test]
    fn test_file_sink_stop_drains_queued_buffers() {
        // Buffers pushed while the sink is stopped but still connected are
        // written by the drain pass of the next stop.
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let path = dir.path().join("out.bin");
        let mut sink = FileSink::new("sink", &Parameters::path(&path));
        sink.initialize().expect("Failed to initialize");

        let output = OutputPort::new("probe");
        let input = sink.input(DEFAULT_PORT).expect("no input port");
        crate::core::port::connect(&input, &output).expect("Failed to connect");

        // Queue data before the worker even starts.
        let mut data = output.get_buffer();
        data.write_data(b"early").expect("Failed to write");
        output.push_buffer(data).expect("Failed to push");

        sink.send_command(Command::Start).expect("Failed to start");
        sink.send_command(Command::Stop).expect("Failed to stop");

        let written = std::fs::read(&path).expect("Failed to read output file");
        assert_eq!(written, b"early");
    }

    #[test]
    fn test_set_parameters_after_initialize_fails() {
        let file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let mut src = FileSrc::new("src", &Parameters::path(file.path()));
        src.initialize().expect("Failed to initialize");
        assert!(matches!(
            src.set_parameters(&Parameters::path("/elsewhere")),
            Err(Error::InvalidState { .. })
        ));
        let reported = src.get_parameters().expect("Failed to get parameters");
        assert_eq!(reported.path.as_deref(), Some(file.path()));
        src.uninitialize().expect("Failed to uninitialize");
    }
}
