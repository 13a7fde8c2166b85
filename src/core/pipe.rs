// src/core/pipe.rs - Graph-level ownership and broadcast control
//
// A Pipe owns a collection of devices keyed by (kind, name), tracks the
// device-to-device links made through it, and fans lifecycle operations
// out to every owned device. Port-granularity connect/disconnect are the
// primitive operations; the device-level variants are sugar over the
// default ports. Start is broadcast consumers-first and Stop
// producers-first, derived from the tracked links, so a producer never
// streams into a consumer that is not running.

use crate::core::device::{Command, Device, DeviceKind, DeviceState, Parameters, DEFAULT_PORT};
use crate::core::port::{self, InputPort, OutputPort};
use crate::error::{Error, Result};
use log::{debug, info};
use std::sync::Arc;

/// Constructs a device for `add_device`/`get_device`. The plain
/// [`Pipe::new`] pipe has no factory; [`av_pipe`](crate::io::av_pipe)
/// installs the standard screencasting one.
pub type DeviceFactory = fn(DeviceKind, &str, &Parameters) -> Result<Box<dyn Device>>;

fn no_factory(_: DeviceKind, _: &str, _: &Parameters) -> Result<Box<dyn Device>> {
    Err(Error::NotImplemented)
}

type DeviceKey = (DeviceKind, String);

/// Owner and coordinator of a set of devices and their connections.
pub struct Pipe {
    name: String,
    factory: DeviceFactory,
    devices: Vec<Box<dyn Device>>,
    links: Vec<(DeviceKey, DeviceKey)>,
}

impl Pipe {
    /// A pipe with no device factory: devices can only be added through
    /// [`get_device`](Pipe::get_device)/[`add_device`](Pipe::add_device)
    /// once a factory exists, so this form is for graphs wired from
    /// externally constructed devices and standalone ports.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_factory(name, no_factory)
    }

    pub fn with_factory(name: impl Into<String>, factory: DeviceFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            devices: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Construct a device via the factory and register it. Fails if a
    /// device with the same (kind, name) key already exists.
    pub fn add_device(
        &mut self,
        kind: DeviceKind,
        name: &str,
        parameters: Parameters,
    ) -> Result<()> {
        if self.position_named(kind, name).is_some() {
            return Err(Error::DuplicateDevice {
                kind: kind.as_str(),
                name: name.to_string(),
            });
        }
        let device = (self.factory)(kind, name, &parameters)?;
        info!("pipe '{}': added {} '{}'", self.name, kind.as_str(), name);
        self.devices.push(device);
        Ok(())
    }

    /// Return the device registered under (kind, name), constructing and
    /// registering it first if absent.
    pub fn get_device(
        &mut self,
        kind: DeviceKind,
        name: &str,
        parameters: Parameters,
    ) -> Result<&mut dyn Device> {
        if self.position_named(kind, name).is_none() {
            self.add_device(kind, name, parameters)?;
        }
        let index = self
            .position_named(kind, name)
            .expect("device registered above");
        Ok(self.devices[index].as_mut())
    }

    /// First registered device of `kind`, if any. Pure lookup.
    pub fn find_device(&self, kind: DeviceKind) -> Option<&dyn Device> {
        self.devices
            .iter()
            .find(|d| d.kind() == kind)
            .map(|d| d.as_ref())
    }

    pub fn find_device_mut(&mut self, kind: DeviceKind) -> Option<&mut dyn Device> {
        self.devices
            .iter_mut()
            .find(|d| d.kind() == kind)
            .map(|d| &mut **d as &mut dyn Device)
    }

    pub fn find_device_named(&self, kind: DeviceKind, name: &str) -> Option<&dyn Device> {
        self.position_named(kind, name)
            .map(|i| self.devices[i].as_ref())
    }

    pub fn find_device_named_mut(
        &mut self,
        kind: DeviceKind,
        name: &str,
    ) -> Option<&mut dyn Device> {
        self.position_named(kind, name)
            .map(move |i| &mut *self.devices[i] as &mut dyn Device)
    }

    /// Remove the first device of `kind`. The device must be
    /// uninitialized and not referenced by any tracked link.
    pub fn remove_device(&mut self, kind: DeviceKind) -> Result<()> {
        let index = self
            .devices
            .iter()
            .position(|d| d.kind() == kind)
            .ok_or(Error::DeviceNotFound {
                kind: kind.as_str(),
            })?;
        self.remove_at(index)
    }

    /// Remove the device registered under exactly (kind, name).
    pub fn remove_device_named(&mut self, kind: DeviceKind, name: &str) -> Result<()> {
        let index = self.position_named(kind, name).ok_or(Error::DeviceNotFound {
            kind: kind.as_str(),
        })?;
        self.remove_at(index)
    }

    fn remove_at(&mut self, index: usize) -> Result<()> {
        let device = &self.devices[index];
        if device.state() != DeviceState::Uninitialized {
            return Err(Error::DeviceBusy(device.name().to_string()));
        }
        let key = (device.kind(), device.name().to_string());
        if self.links.iter().any(|(a, b)| *a == key || *b == key) {
            return Err(Error::DeviceBusy(key.1));
        }
        let removed = self.devices.remove(index);
        debug!("pipe '{}': removed '{}'", self.name, removed.name());
        Ok(())
    }

    /// Connect `a`'s default output to `b`'s default input and track the
    /// ordered link. The devices need not be owned by this pipe.
    pub fn connect_devices(&mut self, a: &dyn Device, b: &dyn Device) -> Result<()> {
        let key = Self::link_key(a, b);
        if self.links.contains(&key) {
            return Err(Error::AlreadyConnected(a.name().to_string()));
        }
        let output = a.output(DEFAULT_PORT).ok_or_else(|| Error::NoSuchPort {
            device: a.name().to_string(),
            index: DEFAULT_PORT,
        })?;
        let input = b.input(DEFAULT_PORT).ok_or_else(|| Error::NoSuchPort {
            device: b.name().to_string(),
            index: DEFAULT_PORT,
        })?;
        port::connect(&input, &output)?;
        self.links.push(key);
        Ok(())
    }

    /// Tear down the tracked link from `a` to `b`. Links are ordered
    /// pairs: disconnecting (b, a) when (a, b) is linked fails.
    pub fn disconnect_devices(&mut self, a: &dyn Device, b: &dyn Device) -> Result<()> {
        let key = Self::link_key(a, b);
        let position = self
            .links
            .iter()
            .position(|k| *k == key)
            .ok_or_else(|| Error::NotConnected {
                input: b.name().to_string(),
                output: a.name().to_string(),
            })?;
        let output = a.output(DEFAULT_PORT).ok_or_else(|| Error::NoSuchPort {
            device: a.name().to_string(),
            index: DEFAULT_PORT,
        })?;
        let input = b.input(DEFAULT_PORT).ok_or_else(|| Error::NoSuchPort {
            device: b.name().to_string(),
            index: DEFAULT_PORT,
        })?;
        port::disconnect(&input, &output)?;
        self.links.remove(position);
        Ok(())
    }

    /// Primitive port-granularity connect; works for standalone ports not
    /// owned by any device.
    pub fn connect_ports(&self, input: &Arc<InputPort>, output: &Arc<OutputPort>) -> Result<()> {
        port::connect(input, output)
    }

    pub fn disconnect_ports(&self, input: &Arc<InputPort>, output: &Arc<OutputPort>) -> Result<()> {
        port::disconnect(input, output)
    }

    /// Broadcast initialize to every owned device. All devices are
    /// attempted; the first error is returned.
    pub fn initialize(&mut self) -> Result<()> {
        self.broadcast(|d| d.initialize())
    }

    /// Broadcast uninitialize (idempotent per device).
    pub fn uninitialize(&mut self) -> Result<()> {
        self.broadcast(|d| d.uninitialize())
    }

    /// Broadcast pre-roll setup.
    pub fn prepare(&mut self) -> Result<()> {
        self.broadcast(|d| d.prepare())
    }

    /// Broadcast reset, returning every stopped device to a state where
    /// initialize can run again.
    pub fn reset(&mut self) -> Result<()> {
        self.broadcast(|d| d.reset())
    }

    /// Broadcast a command. `Start` visits consumers before producers and
    /// `Stop` producers before consumers, per the tracked links.
    pub fn send_command(&mut self, command: Command) -> Result<()> {
        let mut order = self.topological_order();
        if command == Command::Start {
            order.reverse();
        }
        let mut first_error = None;
        for index in order {
            if let Err(e) = self.devices[index].send_command(command) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn broadcast<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn Device) -> Result<()>,
    {
        let mut first_error = None;
        for device in &mut self.devices {
            if let Err(e) = f(device.as_mut()) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn position_named(&self, kind: DeviceKind, name: &str) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.kind() == kind && d.name() == name)
    }

    fn link_key(a: &dyn Device, b: &dyn Device) -> (DeviceKey, DeviceKey) {
        (
            (a.kind(), a.name().to_string()),
            (b.kind(), b.name().to_string()),
        )
    }

    /// Kahn's algorithm over the tracked links, producers first. Devices
    /// outside any link keep their insertion order.
    fn topological_order(&self) -> Vec<usize> {
        let key_of = |d: &dyn Device| (d.kind(), d.name().to_string());
        let position = |key: &DeviceKey| {
            self.devices
                .iter()
                .position(|d| key_of(d.as_ref()) == *key)
        };

        let n = self.devices.len();
        let mut indegree = vec![0usize; n];
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (from, to) in &self.links {
            if let (Some(a), Some(b)) = (position(from), position(to)) {
                edges.push((a, b));
                indegree[b] += 1;
            }
        }

        let mut order = Vec::with_capacity(n);
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        while let Some(index) = ready.first().copied() {
            ready.remove(0);
            order.push(index);
            for &(a, b) in &edges {
                if a == index {
                    indegree[b] -= 1;
                    if indegree[b] == 0 {
                        ready.push(b);
                    }
                }
            }
        }
        // A cycle in the links leaves devices unvisited; append them in
        // insertion order so broadcast still reaches everything.
        for i in 0..n {
            if !order.contains(&i) {
                order.push(i);
            }
        }
        order
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.name)
            .field("devices", &self.devices.len())
            .field("links", &self.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{require_state, Event, WorkerControl};
    use crate::error::Error;

    /// Minimal pass-through device used to exercise the graph plumbing.
    struct TestDevice {
        name: String,
        state: DeviceState,
        input: Option<Arc<InputPort>>,
        output: Option<Arc<OutputPort>>,
        worker: Option<WorkerControl>,
    }

    impl TestDevice {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                state: DeviceState::Uninitialized,
                input: None,
                output: None,
                worker: None,
            }
        }
    }

    impl Device for TestDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::VideoTunnel
        }

        fn state(&self) -> DeviceState {
            self.state
        }

        fn initialize(&mut self) -> Result<()> {
            require_state(self.state, DeviceState::Uninitialized, "initialize")?;
            self.input = Some(InputPort::new(format!("{} in", self.name)));
            self.output = Some(OutputPort::new(format!("{} out", self.name)));
            self.state = DeviceState::Initialized;
            Ok(())
        }

        fn uninitialize(&mut self) -> Result<()> {
            if self.state == DeviceState::Running {
                return Err(Error::InvalidState {
                    op: "uninitialize",
                    state: "running",
                });
            }
            self.input = None;
            self.output = None;
            self.state = DeviceState::Uninitialized;
            Ok(())
        }

        fn input(&self, index: usize) -> Option<Arc<InputPort>> {
            (index == DEFAULT_PORT)
                .then(|| self.input.clone())
                .flatten()
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
                    self.worker = Some(
                        WorkerControl::spawn("test-device", |stop| {
                            while !crate::core::device::should_stop(&stop) {
                                std::thread::sleep(std::time::Duration::from_millis(1));
                            }
                        })
                        .expect("Failed to spawn"),
                    );
                    self.state = DeviceState::Running;
                }
                Command::Stop => {
                    if self.state == DeviceState::Uninitialized {
                        return Err(Error::InvalidState {
                            op: "stop",
                            state: "uninitialized",
                        });
                    }
                    if let Some(mut worker) = self.worker.take() {
                        worker.stop();
                    }
                    if self.state == DeviceState::Running {
                        self.state = DeviceState::Stopped;
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_device_lifecycle() {
        let mut device = TestDevice::new("dev");
        assert!(matches!(
            device.send_command(Command::Start),
            Err(Error::InvalidState { .. })
        ));
        device.initialize().expect("Failed to initialize");
        assert!(device.initialize().is_err());
        assert!(device.input(0).is_some());
        assert!(device.output(0).is_some());
        assert!(device.input(1).is_none());
        device.notify(Event::EndOfStream).expect("notify");
        device.send_command(Command::Start).expect("Failed to start");
        assert_eq!(device.state(), DeviceState::Running);
        device.send_command(Command::Stop).expect("Failed to stop");
        assert_eq!(device.state(), DeviceState::Stopped);
        device.uninitialize().expect("Failed to uninitialize");
        assert!(device.input(0).is_none());
        assert!(device.output(0).is_none());
    }

    #[test]
    fn test_device_connections() {
        let mut pipe = Pipe::new("pipe 0");
        let mut src = TestDevice::new("src");
        let mut dst = TestDevice::new("dst");
        src.initialize().expect("Failed to initialize src");
        dst.initialize().expect("Failed to initialize dst");

        assert_eq!(pipe.name(), "pipe 0");
        assert!(pipe.disconnect_devices(&src, &dst).is_err());
        pipe.connect_devices(&src, &dst).expect("Failed to connect");
        assert!(pipe.connect_devices(&src, &dst).is_err());
        pipe.disconnect_devices(&src, &dst)
            .expect("Failed to disconnect");
        // Directional: (dst, src) was never linked.
        assert!(pipe.disconnect_devices(&dst, &src).is_err());
        pipe.connect_devices(&src, &dst).expect("Failed to reconnect");
        pipe.disconnect_devices(&src, &dst)
            .expect("Failed to disconnect");

        src.uninitialize().expect("Failed to uninitialize");
        dst.uninitialize().expect("Failed to uninitialize");
    }

    #[test]
    fn test_connect_uninitialized_device_fails() {
        // An uninitialized device has no ports, so the device-level sugar
        // has nothing to connect.
        let mut pipe = Pipe::new("pipe 0");
        let src = TestDevice::new("src");
        let mut dst = TestDevice::new("dst");
        dst.initialize().expect("Failed to initialize");
        assert!(matches!(
            pipe.connect_devices(&src, &dst),
            Err(Error::NoSuchPort { .. })
        ));
        dst.uninitialize().expect("Failed to uninitialize");
    }

    fn test_factory(kind: DeviceKind, name: &str, _: &Parameters) -> Result<Box<dyn Device>> {
        match kind {
            DeviceKind::VideoTunnel => Ok(Box::new(TestDevice::new(name))),
            _ => Err(Error::NotImplemented),
        }
    }

    #[test]
    fn test_add_find_remove() {
        let mut pipe = Pipe::with_factory("pipe 0", test_factory);
        pipe.add_device(DeviceKind::VideoTunnel, "tunnel", Parameters::default())
            .expect("Failed to add");
        assert!(matches!(
            pipe.add_device(DeviceKind::VideoTunnel, "tunnel", Parameters::default()),
            Err(Error::DuplicateDevice { .. })
        ));
        assert_eq!(
            pipe.find_device(DeviceKind::VideoTunnel)
                .expect("not found")
                .name(),
            "tunnel"
        );
        assert!(pipe.find_device(DeviceKind::Demux).is_none());
        assert!(pipe
            .find_device_named(DeviceKind::VideoTunnel, "other")
            .is_none());

        pipe.remove_device(DeviceKind::VideoTunnel)
            .expect("Failed to remove");
        assert!(matches!(
            pipe.remove_device(DeviceKind::VideoTunnel),
            Err(Error::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_get_device_returns_existing() {
        let mut pipe = Pipe::with_factory("pipe 0", test_factory);
        pipe.get_device(DeviceKind::VideoTunnel, "tunnel", Parameters::default())
            .expect("Failed to create");
        assert_eq!(pipe.device_count(), 1);
        pipe.get_device(DeviceKind::VideoTunnel, "tunnel", Parameters::default())
            .expect("Failed to look up");
        assert_eq!(pipe.device_count(), 1);
    }

    #[test]
    fn test_remove_initialized_device_fails() {
        let mut pipe = Pipe::with_factory("pipe 0", test_factory);
        pipe.add_device(DeviceKind::VideoTunnel, "tunnel", Parameters::default())
            .expect("Failed to add");
        pipe.initialize().expect("Failed to initialize");
        assert!(matches!(
            pipe.remove_device(DeviceKind::VideoTunnel),
            Err(Error::DeviceBusy(_))
        ));
        pipe.uninitialize().expect("Failed to uninitialize");
        pipe.remove_device(DeviceKind::VideoTunnel)
            .expect("Failed to remove");
    }

    #[test]
    fn test_broadcast_lifecycle_and_reset() {
        let mut pipe = Pipe::with_factory("pipe 0", test_factory);
        pipe.add_device(DeviceKind::VideoTunnel, "a", Parameters::default())
            .expect("Failed to add");
        pipe.add_device(DeviceKind::VideoTunnel, "b", Parameters::default())
            .expect("Failed to add");

        // Start before initialize fails across the broadcast.
        assert!(pipe.send_command(Command::Start).is_err());

        pipe.initialize().expect("Failed to initialize");
        pipe.prepare().expect("Failed to prepare");
        pipe.send_command(Command::Start).expect("Failed to start");
        pipe.send_command(Command::Stop).expect("Failed to stop");
        pipe.reset().expect("Failed to reset");
        // Reset left every device re-initializable.
        pipe.initialize().expect("Failed to re-initialize");
        pipe.uninitialize().expect("Failed to uninitialize");
    }
}
