// src/io/socket.rs - TCP transport endpoints and devices
//
// Wire format: 4-byte big-endian payload length, 1 tag byte, payload.
// Peer disconnection is in-band data, not an error: when a sender's
// connection ends, the receiving side synthesizes a buffer carrying the
// `Disconnect` payload (tagged Break) onto its queue and goes back to
// accepting, so one listener outlives any number of senders.
//
// Four surfaces:
// - SocketOutput / SocketInput: standalone endpoints with the port API
// - SocketTransmitter / SocketReceiver: the same transports packaged as
//   devices with an input/output port and a worker

use crate::core::buffer::{Buffer, BufferPool, Tag, DEFAULT_BUFFER_CAPACITY, DEFAULT_POOL_CAPACITY};
use crate::core::device::{
    require_state, should_stop, Command, Device, DeviceKind, DeviceState, Parameters,
    WorkerControl, DEFAULT_PORT, POLL_INTERVAL,
};
use crate::core::port::{InputPort, OutputPort};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Payload of the buffer a receiver queues when a sender's connection
/// ends. Wire-visible and fixed.
pub const DISCONNECT_SENTINEL: &[u8] = b"Disconnect";

const FRAME_HEADER_LEN: usize = 5;

fn write_frame(stream: &mut TcpStream, tag: Tag, payload: &[u8]) -> std::io::Result<()> {
    stream.write_u32::<BigEndian>(payload.len() as u32)?;
    stream.write_u8(tag.to_byte())?;
    stream.write_all(payload)
}

/// Incremental frame parser over a byte accumulator. Reads may deliver
/// partial frames or several at once; this keeps the remainder across
/// reads so frame boundaries never depend on read boundaries.
struct FrameReader {
    pending: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_frame(&mut self, max_payload: usize) -> Result<Option<(Tag, Vec<u8>)>> {
        if self.pending.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&self.pending[..4]) as usize;
        if len > max_payload {
            return Err(Error::FrameTooLarge {
                len,
                capacity: max_payload,
            });
        }
        if self.pending.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let tag = Tag::from_byte(self.pending[4]);
        let payload = self.pending[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.pending.drain(..FRAME_HEADER_LEN + len);
        Ok(Some((tag, payload)))
    }
}

/// Client-side endpoint: frames pushed buffers onto a TCP connection.
///
/// Dropping a `SocketOutput` shuts the connection down; the listening
/// peer then observes the disconnect sentinel.
pub struct SocketOutput {
    name: String,
    pool: BufferPool,
    stream: TcpStream,
}

impl SocketOutput {
    pub fn new(name: impl Into<String>, host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let name = name.into();
        info!("socket output '{}': connected to {host}:{port}", name);
        Ok(Self {
            name,
            pool: BufferPool::default(),
            stream,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_buffer(&self) -> Buffer {
        self.pool.acquire()
    }

    /// Frame the buffer's tag and payload onto the connection. The buffer
    /// recycles to the pool whether or not the write succeeds.
    pub fn push_buffer(&mut self, buffer: Buffer) -> Result<()> {
        write_frame(&mut self.stream, buffer.tag(), buffer.data())?;
        Ok(())
    }
}

impl Drop for SocketOutput {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Pull bytes out of one accepted connection until it ends or stop is
/// requested. Returns false if stop was requested.
fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: &BufferPool,
    tx: &Sender<Buffer>,
    stop: &AtomicBool,
) -> bool {
    if let Err(e) = stream.set_read_timeout(Some(POLL_INTERVAL)) {
        error!("socket input: read timeout setup failed: {e}");
        return true;
    }
    let mut reader = FrameReader::new();
    let mut scratch = [0u8; 4096];
    loop {
        if should_stop(stop) {
            return false;
        }
        match stream.read(&mut scratch) {
            Ok(0) => {
                debug!("socket input: peer {peer} disconnected");
                return true;
            }
            Ok(n) => {
                reader.extend(&scratch[..n]);
                loop {
                    match reader.next_frame(pool.buffer_size()) {
                        Ok(Some((tag, payload))) => {
                            if !deliver(pool, tx, tag, &payload, stop) {
                                return false;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("socket input: dropping peer {peer}: {e}");
                            return true;
                        }
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                debug!("socket input: peer {peer} read failed: {e}");
                return true;
            }
        }
    }
}

/// Move one received frame into a pool buffer and queue it. Blocks (in
/// poll-interval slices) while the pool is drained, so inbound data is
/// back-pressured, never dropped. Returns false if stop was requested.
fn deliver(
    pool: &BufferPool,
    tx: &Sender<Buffer>,
    tag: Tag,
    payload: &[u8],
    stop: &AtomicBool,
) -> bool {
    loop {
        if should_stop(stop) {
            return false;
        }
        let Ok(mut buffer) = pool.acquire_timeout(POLL_INTERVAL) else {
            continue;
        };
        if let Err(e) = buffer.write_data(payload) {
            // Frame size was checked against the pool before delivery.
            error!("socket input: frame store failed: {e}");
            return true;
        }
        buffer.set_tag(tag);
        if tx.send(buffer).is_err() {
            return false;
        }
        return true;
    }
}

fn queue_sentinel(pool: &BufferPool, tx: &Sender<Buffer>, stop: &AtomicBool) -> bool {
    deliver(pool, tx, Tag::Break, DISCONNECT_SENTINEL, stop)
}

/// Listening endpoint: accepts one sender at a time and queues received
/// frames as filled buffers.
///
/// Binding port 0 picks an ephemeral port; [`local_addr`] reports the
/// actual one. The accept loop runs for the lifetime of the value and
/// survives sender churn: each disconnect queues a sentinel buffer and
/// the loop accepts the next sender.
///
/// [`local_addr`]: SocketInput::local_addr
pub struct SocketInput {
    name: String,
    addr: SocketAddr,
    pool: BufferPool,
    rx: Receiver<Buffer>,
    _worker: WorkerControl,
}

impl SocketInput {
    pub fn new(name: impl Into<String>, host: &str, port: u16) -> Result<Self> {
        let name = name.into();
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!("socket input '{}': listening on {addr}", name);

        let pool = BufferPool::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_CAPACITY);
        let (tx, rx) = unbounded();
        let worker_pool = pool.clone();
        let worker = WorkerControl::spawn(&format!("socket-input-{name}"), move |stop| {
            Self::accept_loop(listener, worker_pool, tx, &stop);
        })?;

        Ok(Self {
            name,
            addr,
            pool,
            rx,
            _worker: worker,
        })
    }

    fn accept_loop(listener: TcpListener, pool: BufferPool, tx: Sender<Buffer>, stop: &AtomicBool) {
        while !should_stop(stop) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("socket input: accepted {peer}");
                    if !serve_connection(stream, peer, &pool, &tx, stop) {
                        return;
                    }
                    if !queue_sentinel(&pool, &tx, stop) {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!("socket input: accept failed: {e}");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actually bound address; authoritative when constructed with
    /// port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_buffer_available(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Next received buffer in arrival order, without blocking.
    pub fn get_filled_buffer(&self) -> Option<Buffer> {
        self.rx.try_recv().ok()
    }

    /// Next received buffer, waiting up to `timeout`.
    pub fn wait_filled(&self, timeout: Duration) -> Option<Buffer> {
        match self.rx.recv_timeout(timeout) {
            Ok(buffer) => Some(buffer),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn recycle_buffer(&self, buffer: Buffer) -> Result<()> {
        drop(buffer);
        Ok(())
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

/// Device wrapper around [`SocketInput`]: republishes every received
/// buffer (sentinels included) on its output port.
pub struct SocketReceiver {
    name: String,
    state: DeviceState,
    host: String,
    port: u16,
    socket: Option<Arc<SocketInput>>,
    output: Option<Arc<OutputPort>>,
    worker: Option<WorkerControl>,
}

impl SocketReceiver {
    pub fn new(name: impl Into<String>, parameters: &Parameters) -> Self {
        Self {
            name: name.into(),
            state: DeviceState::Uninitialized,
            host: parameters.host.clone().unwrap_or_else(|| "0.0.0.0".into()),
            port: parameters.port.unwrap_or(0),
            socket: None,
            output: None,
            worker: None,
        }
    }

    fn pump(socket: &SocketInput, output: &OutputPort, stop: &AtomicBool) {
        while !should_stop(stop) {
            let Some(buffer) = socket.wait_filled(POLL_INTERVAL) else {
                continue;
            };
            if let Err(e) = output.push_buffer(buffer) {
                debug!("socket receiver '{}': dropped buffer: {e}", output.name());
            }
        }
    }
}

impl Device for SocketReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::SocketReceiver
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn initialize(&mut self) -> Result<()> {
        require_state(self.state, DeviceState::Uninitialized, "initialize")?;
        let socket = SocketInput::new(format!("{} rx", self.name), &self.host, self.port)?;
        self.port = socket.local_addr().port();
        self.socket = Some(Arc::new(socket));
        self.output = Some(OutputPort::new(format!("{} out", self.name)));
        self.state = DeviceState::Initialized;
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
        self.socket = None;
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
                let socket = Arc::clone(self.socket.as_ref().expect("initialized without socket"));
                let output = Arc::clone(self.output.as_ref().expect("initialized without port"));
                output.set_streaming(true);
                let worker =
                    WorkerControl::spawn(&format!("socket-recv-{}", self.name), move |stop| {
                        Self::pump(&socket, &output, &stop);
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
        if let Some(host) = &parameters.host {
            self.host = host.clone();
        }
        if let Some(port) = parameters.port {
            self.port = port;
        }
        Ok(())
    }

    /// After initialize this reports the actually bound port, which is
    /// how a caller learns the ephemeral port picked for a port-0 bind.
    fn get_parameters(&self) -> Result<Parameters> {
        Ok(Parameters::socket(self.host.clone(), self.port))
    }
}

/// Device wrapper around an outbound connection: frames every buffer
/// arriving on its input port onto the TCP stream.
pub struct SocketTransmitter {
    name: String,
    state: DeviceState,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    input: Option<Arc<InputPort>>,
    worker: Option<WorkerControl>,
}

impl SocketTransmitter {
    pub fn new(name: impl Into<String>, parameters: &Parameters) -> Self {
        Self {
            name: name.into(),
            state: DeviceState::Uninitialized,
            host: parameters
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".into()),
            port: parameters.port.unwrap_or(0),
            stream: None,
            input: None,
            worker: None,
        }
    }

    fn pump(input: &InputPort, stream: &mut TcpStream, stop: &AtomicBool) {
        while !should_stop(stop) {
            let Some(buffer) = input.wait_filled(POLL_INTERVAL) else {
                continue;
            };
            if let Err(e) = write_frame(stream, buffer.tag(), buffer.data()) {
                error!("socket transmitter '{}': write failed: {e}", input.name());
                break;
            }
        }
        // Flush the queue so a stop never strands data behind it.
        while let Some(buffer) = input.get_filled_buffer() {
            if let Err(e) = write_frame(stream, buffer.tag(), buffer.data()) {
                error!("socket transmitter '{}': write failed: {e}", input.name());
                break;
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
        while !should_stop(stop) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Device for SocketTransmitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::SocketTransmitter
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn initialize(&mut self) -> Result<()> {
        require_state(self.state, DeviceState::Uninitialized, "initialize")?;
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;
        info!(
            "socket transmitter '{}': connected to {}:{}",
            self.name, self.host, self.port
        );
        self.stream = Some(stream);
        self.input = Some(InputPort::new(format!("{} in", self.name)));
        self.state = DeviceState::Initialized;
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
        self.stream = None;
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
                let mut stream = self.stream.take().expect("initialized without stream");
                input.set_streaming(true);
                let worker =
                    WorkerControl::spawn(&format!("socket-xmit-{}", self.name), move |stop| {
                        Self::pump(&input, &mut stream, &stop);
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
        if let Some(host) = &parameters.host {
            self.host = host.clone();
        }
        if let Some(port) = parameters.port {
            self.port = port;
        }
        Ok(())
    }

    fn get_parameters(&self) -> Result<Parameters> {
        Ok(Parameters::socket(self.host.clone(), self.port))
    }
}
