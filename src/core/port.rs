// src/core/port.rs - Input/Output ports and the connect/disconnect protocol
//
// A connected Output/Input pair is the sole path buffers travel between two
// devices. The filled queue is a crossbeam channel created per connection:
// strict FIFO, no loss, no duplication. The channel itself is unbounded -
// the buffer pool behind the output caps how many buffers can be in flight,
// so the queue depth never exceeds the pool capacity.
//
// Connect/disconnect rules:
// - at most one peer per port; connecting a connected port fails
// - disconnect must name the exact connected pair (ordered), else it fails
// - both operations fail fast while either port's device is streaming
// - failures never mutate state

use crate::core::buffer::{Buffer, BufferPool};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

struct OutboundLink {
    tx: Sender<Buffer>,
    peer: Weak<InputPort>,
}

struct InboundLink {
    rx: Receiver<Buffer>,
    peer: Weak<OutputPort>,
}

/// Producer-side endpoint of a device.
///
/// Owns the [`BufferPool`] its buffers are drawn from; [`get_buffer`]
/// blocking on an exhausted pool is the pipeline's natural back-pressure.
///
/// [`get_buffer`]: OutputPort::get_buffer
pub struct OutputPort {
    name: String,
    pool: BufferPool,
    link: Mutex<Option<OutboundLink>>,
    streaming: AtomicBool,
}

impl OutputPort {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_pool(name, BufferPool::default())
    }

    pub fn with_pool(name: impl Into<String>, pool: BufferPool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pool,
            link: Mutex::new(None),
            streaming: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Acquire a free buffer from this port's pool, blocking while none is
    /// available.
    pub fn get_buffer(&self) -> Buffer {
        self.pool.acquire()
    }

    /// Bounded variant of [`get_buffer`] for worker loops that must keep
    /// observing their stop flag.
    ///
    /// [`get_buffer`]: OutputPort::get_buffer
    pub fn get_buffer_timeout(&self, timeout: Duration) -> Result<Buffer> {
        self.pool.acquire_timeout(timeout)
    }

    /// Hand a filled buffer to the connected input's filled queue.
    ///
    /// Fails if no peer is connected; the buffer then recycles back to its
    /// pool and is not observable anywhere.
    pub fn push_buffer(&self, buffer: Buffer) -> Result<()> {
        let mut link = self.link.lock().expect("port lock poisoned");
        let Some(outbound) = link.as_ref() else {
            return Err(Error::NoPeer(self.name.clone()));
        };
        if outbound.tx.send(buffer).is_err() {
            // Peer input was dropped without a disconnect; sever the link.
            debug!("output '{}': peer queue gone, dropping link", self.name);
            *link = None;
            return Err(Error::NoPeer(self.name.clone()));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().expect("port lock poisoned").is_some()
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Consumer-side endpoint of a device.
///
/// The filled queue preserves exact push order (FIFO); a consumer observes
/// buffers in the order the producer pushed them, which is what makes tag
/// sequencing (`Start` before the data it precedes) reliable. Reads never
/// block; workers poll with [`wait_filled`].
///
/// Also owns a [`BufferPool`] of its own, used by socket-style receivers
/// that allocate on arrival rather than pull from an upstream output.
///
/// [`wait_filled`]: InputPort::wait_filled
pub struct InputPort {
    name: String,
    pool: BufferPool,
    link: Mutex<Option<InboundLink>>,
    streaming: AtomicBool,
}

impl InputPort {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_pool(name, BufferPool::default())
    }

    pub fn with_pool(name: impl Into<String>, pool: BufferPool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pool,
            link: Mutex::new(None),
            streaming: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Non-blocking check of the filled queue.
    pub fn is_buffer_available(&self) -> bool {
        let link = self.link.lock().expect("port lock poisoned");
        link.as_ref().map(|l| !l.rx.is_empty()).unwrap_or(false)
    }

    /// Pop the next filled buffer in push order, or `None` if the queue is
    /// empty or the port is unconnected. Never blocks.
    pub fn get_filled_buffer(&self) -> Option<Buffer> {
        let link = self.link.lock().expect("port lock poisoned");
        link.as_ref().and_then(|l| l.rx.try_recv().ok())
    }

    /// Pop the next filled buffer, waiting up to `timeout` for one to
    /// arrive. Worker loops use this as their bounded suspension point.
    pub fn wait_filled(&self, timeout: Duration) -> Option<Buffer> {
        // Clone the receiver out so pushes are not blocked while waiting.
        let rx = {
            let link = self.link.lock().expect("port lock poisoned");
            link.as_ref().map(|l| l.rx.clone())
        };
        match rx {
            Some(rx) => match rx.recv_timeout(timeout) {
                Ok(buffer) => Some(buffer),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            None => {
                std::thread::sleep(timeout);
                None
            }
        }
    }

    /// Return a consumed buffer to the pool that originally owned it. The
    /// pool reference travels with the buffer, so this works even after
    /// the ports have been reconnected elsewhere.
    pub fn recycle_buffer(&self, buffer: Buffer) -> Result<()> {
        drop(buffer);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().expect("port lock poisoned").is_some()
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Connect an input/output pair, creating their filled queue.
///
/// Fails without side effects if either port already has a peer or either
/// port's device is currently streaming.
pub fn connect(input: &Arc<InputPort>, output: &Arc<OutputPort>) -> Result<()> {
    if input.is_streaming() || output.is_streaming() {
        return Err(Error::InvalidState {
            op: "connect ports",
            state: "streaming",
        });
    }
    // Lock order: output before input, same as disconnect.
    let mut out_link = output.link.lock().expect("port lock poisoned");
    if out_link.is_some() {
        return Err(Error::AlreadyConnected(output.name.clone()));
    }
    let mut in_link = input.link.lock().expect("port lock poisoned");
    if in_link.is_some() {
        return Err(Error::AlreadyConnected(input.name.clone()));
    }

    let (tx, rx) = unbounded();
    *out_link = Some(OutboundLink {
        tx,
        peer: Arc::downgrade(input),
    });
    *in_link = Some(InboundLink {
        rx,
        peer: Arc::downgrade(output),
    });
    debug!("connected '{}' -> '{}'", output.name, input.name);
    Ok(())
}

/// Tear down the connection between exactly this pair.
///
/// Buffers still sitting in the filled queue recycle back to their pools.
/// Fails without side effects if the two ports are not connected to each
/// other or if either side is streaming.
pub fn disconnect(input: &Arc<InputPort>, output: &Arc<OutputPort>) -> Result<()> {
    if input.is_streaming() || output.is_streaming() {
        return Err(Error::InvalidState {
            op: "disconnect ports",
            state: "streaming",
        });
    }
    let not_connected = || Error::NotConnected {
        input: input.name.clone(),
        output: output.name.clone(),
    };

    let mut out_link = output.link.lock().expect("port lock poisoned");
    let peer_matches = out_link
        .as_ref()
        .and_then(|l| l.peer.upgrade())
        .map(|peer| Arc::ptr_eq(&peer, input))
        .unwrap_or(false);
    if !peer_matches {
        return Err(not_connected());
    }
    let mut in_link = input.link.lock().expect("port lock poisoned");
    let peer_matches = in_link
        .as_ref()
        .and_then(|l| l.peer.upgrade())
        .map(|peer| Arc::ptr_eq(&peer, output))
        .unwrap_or(false);
    if !peer_matches {
        return Err(not_connected());
    }

    *out_link = None;
    *in_link = None;
    debug!("disconnected '{}' -> '{}'", output.name, input.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::Tag;
    use std::thread;

    #[test]
    fn test_push_without_peer_fails() {
        let output = OutputPort::new("out");
        let buf = output.get_buffer();
        let err = output.push_buffer(buf);
        assert!(matches!(err, Err(Error::NoPeer(_))));
        // The failed push recycled the buffer.
        assert_eq!(output.pool().free_count(), output.pool().capacity());
    }

    #[test]
    fn test_connect_push_pop_round_trip() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        connect(&input, &output).expect("Failed to connect");

        let mut buf = output.get_buffer();
        buf.write_data(b"casting").expect("Failed to write");
        output.push_buffer(buf).expect("Failed to push");

        assert!(input.is_buffer_available());
        let buf = input.get_filled_buffer().expect("no buffer");
        assert_eq!(buf.data(), b"casting");
        assert_eq!(buf.len(), 7);
        input.recycle_buffer(buf).expect("Failed to recycle");
    }

    #[test]
    fn test_double_connect_fails() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        connect(&input, &output).expect("Failed to connect");
        assert!(matches!(
            connect(&input, &output),
            Err(Error::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_disconnect_never_connected_fails() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        assert!(matches!(
            disconnect(&input, &output),
            Err(Error::NotConnected { .. })
        ));
    }

    #[test]
    fn test_reconnect_after_clean_teardown() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        connect(&input, &output).expect("Failed to connect");
        disconnect(&input, &output).expect("Failed to disconnect");
        connect(&input, &output).expect("Failed to reconnect");
    }

    #[test]
    fn test_disconnect_wrong_pair_fails() {
        let input_a = InputPort::new("in-a");
        let input_b = InputPort::new("in-b");
        let output = OutputPort::new("out");
        connect(&input_a, &output).expect("Failed to connect");
        assert!(matches!(
            disconnect(&input_b, &output),
            Err(Error::NotConnected { .. })
        ));
        // The real pair is untouched.
        disconnect(&input_a, &output).expect("Failed to disconnect");
    }

    #[test]
    fn test_connect_while_streaming_fails() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        output.set_streaming(true);
        assert!(matches!(
            connect(&input, &output),
            Err(Error::InvalidState { .. })
        ));
        output.set_streaming(false);
        connect(&input, &output).expect("Failed to connect");
    }

    #[test]
    fn test_disconnect_recycles_in_flight_buffers() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        connect(&input, &output).expect("Failed to connect");

        for _ in 0..3 {
            let buf = output.get_buffer();
            output.push_buffer(buf).expect("Failed to push");
        }
        assert_eq!(
            output.pool().free_count(),
            output.pool().capacity() - 3
        );
        disconnect(&input, &output).expect("Failed to disconnect");
        assert_eq!(output.pool().free_count(), output.pool().capacity());
    }

    #[test]
    fn test_fifo_order_under_concurrency() {
        // No reordering, loss or duplication across a connected pair.
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        connect(&input, &output).expect("Failed to connect");

        const COUNT: u32 = 500;
        let producer_out = Arc::clone(&output);
        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                let mut buf = producer_out.get_buffer();
                buf.write_data(&i.to_be_bytes()).expect("Failed to write");
                producer_out.push_buffer(buf).expect("Failed to push");
            }
        });

        let mut seen = 0u32;
        while seen < COUNT {
            if let Some(buf) = input.wait_filled(Duration::from_millis(100)) {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(buf.data());
                assert_eq!(u32::from_be_bytes(bytes), seen);
                seen += 1;
                input.recycle_buffer(buf).expect("Failed to recycle");
            }
        }
        producer.join().expect("Failed to join producer");
        assert!(input.get_filled_buffer().is_none());
    }

    #[test]
    fn test_tag_travels_with_buffer() {
        let input = InputPort::new("in");
        let output = OutputPort::new("out");
        connect(&input, &output).expect("Failed to connect");

        let mut buf = output.get_buffer();
        buf.set_tag(Tag::Start);
        output.push_buffer(buf).expect("Failed to push");

        let buf = input.get_filled_buffer().expect("no buffer");
        assert_eq!(buf.tag(), Tag::Start);
        assert!(buf.is_empty());
    }
}
