/*!
 * In-memory bus for tests and dry runs.
 *
 * `MockBus` is a shared handle used both to script the simulated
 * instruments (replies to written payloads, serial poll values, latency,
 * injected failures) and to inspect what a controller actually did through
 * the operation log. `MockConnector` hands out `MockChannel`s bound to it.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::address::BusAddress;
use crate::channel::{read_exact_bytes, read_until_terminator, BusChannel, ChannelConnector};
use crate::command::{StatusByte, Terminator};
use crate::error::{BusError, Result};

/// One primitive seen by the mock bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    /// Channel initialization
    Initialize,
    /// Address switch
    SwitchAddress(BusAddress),
    /// Payload written to the addressed device
    Write(BusAddress, Vec<u8>),
    /// Terminated read from the addressed device
    Read(BusAddress),
    /// Fixed-length read from the addressed device
    ReadExact(BusAddress, usize),
    /// Serial poll
    SerialPoll(BusAddress),
    /// Interface clear
    InterfaceClear,
    /// Bridge reset
    Reset,
    /// Channel closed
    Close,
}

/// A logged primitive with its start and end times
#[derive(Debug, Clone)]
pub struct MockRecord {
    /// The primitive
    pub op: MockOp,
    /// When it started
    pub started: Instant,
    /// When it finished
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    replies: HashMap<(u8, Vec<u8>), Vec<u8>>,
    pending: HashMap<u8, VecDeque<u8>>,
    polls: HashMap<u8, VecDeque<u8>>,
    poll_defaults: HashMap<u8, u8>,
    delay: Duration,
    poll_delay: Option<Duration>,
    fail_next: Option<BusError>,
    connect_failure: Option<BusError>,
    address: Option<BusAddress>,
    in_flight: bool,
    overlaps: usize,
    connects: usize,
    log: Vec<MockRecord>,
}

/// Shared, scriptable state of a simulated bus
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer every write of `query` to `primary` with `reply`
    pub fn respond(&self, primary: u8, query: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> &Self {
        self.lock()
            .replies
            .insert((primary, query.as_ref().to_vec()), reply.as_ref().to_vec());
        self
    }

    /// Make `bytes` readable from `primary` without a preceding write
    pub fn push_output(&self, primary: u8, bytes: impl AsRef<[u8]>) -> &Self {
        self.lock()
            .pending
            .entry(primary)
            .or_default()
            .extend(bytes.as_ref().iter().copied());
        self
    }

    /// Queue serial poll values for `primary`, returned once each
    pub fn queue_polls(&self, primary: u8, values: impl IntoIterator<Item = u8>) -> &Self {
        self.lock().polls.entry(primary).or_default().extend(values);
        self
    }

    /// Serial poll value for `primary` once its queue is empty
    ///
    /// Polling a primary with neither a queued nor a default value times
    /// out, as an absent device would.
    pub fn set_poll(&self, primary: u8, value: u8) -> &Self {
        self.lock().poll_defaults.insert(primary, value);
        self
    }

    /// Latency applied to every primitive
    pub fn set_delay(&self, delay: Duration) -> &Self {
        self.lock().delay = delay;
        self
    }

    /// Latency applied to serial polls instead of the general delay
    pub fn set_poll_delay(&self, delay: Duration) -> &Self {
        self.lock().poll_delay = Some(delay);
        self
    }

    /// Fail the next primitive (other than address switches) with `error`
    pub fn fail_next(&self, error: BusError) -> &Self {
        self.lock().fail_next = Some(error);
        self
    }

    /// Fail every connection attempt with `error`
    pub fn fail_connect(&self, error: BusError) -> &Self {
        self.lock().connect_failure = Some(error);
        self
    }

    /// Every primitive performed so far, in order
    pub fn log(&self) -> Vec<MockRecord> {
        self.lock().log.clone()
    }

    /// Logged primitives without timing
    pub fn ops(&self) -> Vec<MockOp> {
        self.lock().log.iter().map(|r| r.op.clone()).collect()
    }

    /// Payloads written to `primary`, in order
    pub fn writes_to(&self, primary: u8) -> Vec<Vec<u8>> {
        self.lock()
            .log
            .iter()
            .filter_map(|r| match &r.op {
                MockOp::Write(address, data) if address.primary() == primary => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of serial polls performed on `primary`
    pub fn poll_count(&self, primary: u8) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|r| matches!(&r.op, MockOp::SerialPoll(a) if a.primary() == primary))
            .count()
    }

    /// Number of times a primitive started while another was still running
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    /// Number of successful connections
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Whether a channel has been closed
    pub fn closed(&self) -> bool {
        self.lock().log.iter().any(|r| r.op == MockOp::Close)
    }

    /// Connector producing channels on this bus
    pub fn connector(&self) -> MockConnector {
        MockConnector { bus: self.clone() }
    }

    fn begin(&self) -> (Instant, Duration) {
        let mut state = self.lock();
        if state.in_flight {
            state.overlaps += 1;
        }
        state.in_flight = true;
        (Instant::now(), state.delay)
    }

    fn finish(&self, op: MockOp, started: Instant) {
        let mut state = self.lock();
        state.in_flight = false;
        state.log.push(MockRecord {
            op,
            started,
            finished: Instant::now(),
        });
    }

    fn take_failure(&self) -> Result<()> {
        match self.lock().fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn current_address(&self) -> Result<BusAddress> {
        self.lock()
            .address
            .ok_or_else(|| BusError::invalid_argument("No device addressed"))
    }

    /// Run `body` as one logged primitive
    async fn primitive<T>(
        &self,
        op: MockOp,
        delay_override: Option<Duration>,
        body: impl FnOnce(&mut MockState) -> Result<T>,
    ) -> Result<T> {
        self.tracked(op, delay_override, true, body).await
    }

    async fn tracked<T>(
        &self,
        op: MockOp,
        delay_override: Option<Duration>,
        injectable: bool,
        body: impl FnOnce(&mut MockState) -> Result<T>,
    ) -> Result<T> {
        let (started, delay) = self.begin();
        let delay = delay_override.unwrap_or(delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = if injectable { self.take_failure() } else { Ok(()) };
        let result = match failure {
            Ok(()) => body(&mut self.lock()),
            Err(error) => Err(error),
        };
        self.finish(op, started);
        result
    }
}

/// Connector for a [`MockBus`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    bus: MockBus,
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn BusChannel>> {
        let mut state = self.bus.lock();
        if let Some(error) = state.connect_failure.clone() {
            return Err(error);
        }
        state.connects += 1;
        debug!("Mock bus connected");
        Ok(Box::new(MockChannel {
            bus: self.bus.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }
}

/// Channel on a [`MockBus`]
#[derive(Debug)]
pub struct MockChannel {
    bus: MockBus,
}

fn pending_read<T>(
    state: &mut MockState,
    primary: u8,
    read: impl FnOnce(&mut &[u8]) -> Result<T>,
) -> Result<T> {
    let queue = state.pending.entry(primary).or_default();
    if queue.is_empty() {
        return Err(BusError::timeout(format!("Device {} has nothing to send", primary)));
    }
    let snapshot: Vec<u8> = queue.iter().copied().collect();
    let mut cursor: &[u8] = &snapshot;
    let result = read(&mut cursor);
    let consumed = snapshot.len() - cursor.len();
    queue.drain(..consumed);
    result
}

/// Drive a reader over an in-memory slice to completion
fn block_on_slice<T>(fut: impl std::future::Future<Output = T>) -> T {
    futures::executor::block_on(fut)
}

#[async_trait]
impl BusChannel for MockChannel {
    async fn initialize(&mut self) -> Result<()> {
        self.bus.primitive(MockOp::Initialize, None, |_| Ok(())).await
    }

    async fn switch_address(&mut self, address: BusAddress) -> Result<()> {
        // Address switches are instant and never consume an injected failure
        self.bus
            .tracked(MockOp::SwitchAddress(address), Some(Duration::ZERO), false, move |state| {
                state.address = Some(address);
                Ok(())
            })
            .await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let address = self.bus.current_address()?;
        let data = data.to_vec();
        self.bus
            .primitive(MockOp::Write(address, data.clone()), None, move |state| {
                if let Some(reply) = state.replies.get(&(address.primary(), data)).cloned() {
                    state
                        .pending
                        .entry(address.primary())
                        .or_default()
                        .extend(reply);
                }
                Ok(())
            })
            .await
    }

    async fn read_until(&mut self, terminator: Terminator) -> Result<Vec<u8>> {
        let address = self.bus.current_address()?;
        self.bus
            .primitive(MockOp::Read(address), None, move |state| {
                pending_read(state, address.primary(), |cursor| {
                    block_on_slice(read_until_terminator(cursor, terminator))
                })
            })
            .await
    }

    async fn read_exact(&mut self, count: usize) -> Result<Vec<u8>> {
        let address = self.bus.current_address()?;
        self.bus
            .primitive(MockOp::ReadExact(address, count), None, move |state| {
                pending_read(state, address.primary(), |cursor| {
                    block_on_slice(read_exact_bytes(cursor, count))
                })
            })
            .await
    }

    async fn serial_poll(&mut self, address: BusAddress) -> Result<StatusByte> {
        let poll_delay = self.bus.lock().poll_delay;
        self.bus
            .primitive(MockOp::SerialPoll(address), poll_delay, move |state| {
                let primary = address.primary();
                state
                    .polls
                    .get_mut(&primary)
                    .and_then(VecDeque::pop_front)
                    .or_else(|| state.poll_defaults.get(&primary).copied())
                    .map(StatusByte)
                    .ok_or_else(|| BusError::timeout(format!("No device answers at {}", address)))
            })
            .await
    }

    async fn interface_clear(&mut self) -> Result<()> {
        self.bus.primitive(MockOp::InterfaceClear, None, |_| Ok(())).await
    }

    async fn reset(&mut self) -> Result<()> {
        self.bus.primitive(MockOp::Reset, None, |_| Ok(())).await
    }

    async fn close(&mut self) -> Result<()> {
        let now = Instant::now();
        self.bus.lock().log.push(MockRecord {
            op: MockOp::Close,
            started: now,
            finished: now,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(primary: u8) -> BusAddress {
        BusAddress::primary_only(primary).unwrap()
    }

    #[tokio::test]
    async fn test_scripted_reply() {
        let bus = MockBus::new();
        bus.respond(5, b"ID?\n", b"MODEL-X\r\n");
        let mut channel = bus.connector().connect().await.unwrap();

        channel.switch_address(addr(5)).await.unwrap();
        channel.write(b"ID?\n").await.unwrap();
        let line = channel.read_until(Terminator::CrLf).await.unwrap();

        assert_eq!(line, b"MODEL-X");
        assert_eq!(bus.writes_to(5), vec![b"ID?\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_read_times_out() {
        let bus = MockBus::new();
        let mut channel = bus.connector().connect().await.unwrap();
        channel.switch_address(addr(1)).await.unwrap();
        assert!(channel.read_until(Terminator::Lf).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_poll_queue_then_default() {
        let bus = MockBus::new();
        bus.queue_polls(3, [0x41]).set_poll(3, 0x01);
        let mut channel = bus.connector().connect().await.unwrap();

        assert_eq!(channel.serial_poll(addr(3)).await.unwrap(), StatusByte(0x41));
        assert_eq!(channel.serial_poll(addr(3)).await.unwrap(), StatusByte(0x01));
        assert_eq!(bus.poll_count(3), 2);
        assert!(channel.serial_poll(addr(4)).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = MockBus::new();
        bus.fail_next(BusError::io("cable pulled"));
        let mut channel = bus.connector().connect().await.unwrap();
        assert!(channel.interface_clear().await.unwrap_err().is_fatal());
        assert!(channel.interface_clear().await.is_ok());

        bus.fail_connect(BusError::io("refused"));
        assert!(bus.connector().connect().await.is_err());
        assert_eq!(bus.connects(), 1);
    }

    #[tokio::test]
    async fn test_address_switch_keeps_injected_failure() {
        let bus = MockBus::new();
        bus.fail_next(BusError::unsupported("no reads"));
        let mut channel = bus.connector().connect().await.unwrap();

        channel.switch_address(addr(2)).await.unwrap();
        let err = channel.read_until(Terminator::Lf).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
        assert!(matches!(bus.log()[0].op, MockOp::SwitchAddress(a) if a == addr(2)));
    }

    #[tokio::test]
    async fn test_address_switch_during_write_is_an_overlap() {
        let bus = MockBus::new();
        bus.set_delay(Duration::from_millis(50));
        let mut first = bus.connector().connect().await.unwrap();
        let mut second = bus.connector().connect().await.unwrap();
        first.switch_address(addr(1)).await.unwrap();
        assert_eq!(bus.overlaps(), 0);

        let write = tokio::spawn(async move { first.write(b"SLOW\n").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        second.switch_address(addr(2)).await.unwrap();
        write.await.unwrap().unwrap();

        assert_eq!(bus.overlaps(), 1);
    }
}
