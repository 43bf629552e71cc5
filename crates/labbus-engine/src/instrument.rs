/*!
 * Instrument orchestrator.
 *
 * An `Instrument` drives one device through a driver. It owns:
 *
 * - a FIFO command queue drained by a command worker, so callers never block
 *   on `add_command`;
 * - acquisition loops for status, settings and readings, each with its own
 *   period, publishing to listeners and to a cached last value;
 * - an interrupt collector that serial-polls the device and queues status
 *   bytes requesting service, and a dispatcher that hands them to listeners
 *   and to the driver.
 *
 * Lifecycle: `STOPPED -> ACTIVE -> (ERROR | STOPPED)`. I/O and unsupported
 * failures in a background task put the instrument in `ERROR` and cancel all
 * of its other tasks. Timeouts and malformed responses are logged and the
 * task carries on with its next cycle.
 */
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument as _};

use labbus_core::config::{period_from_secs, BusConfig, InstrumentConfig};
use labbus_core::event::{ListenerId, ListenerSet};
use labbus_core::logging::task_span;
use labbus_core::service::{ServiceCell, ServiceState};
use labbus_core::types::Sample;
use labbus_core::utils::{sleep_or_cancel, sleep_remaining};
use labbus_devices::command::StatusByte;
use labbus_devices::device::Device;
use labbus_devices::error::{BusError, ErrorKind};

use crate::context::InstrumentContext;
use crate::driver::{InstrumentDriver, Periods};
use crate::error::{Error, Result};
use crate::permit::{ChannelPermit, PermitPolicy, PermitSlot};

/// Delay after a failed interrupt collection cycle
pub const DEFAULT_ERROR_PENALTY: Duration = Duration::from_millis(500);

/// Background tasks of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Processes queued caller commands
    Commands,
    /// Status acquisition loop
    Status,
    /// Settings acquisition loop
    Settings,
    /// Reading acquisition loop
    Reading,
    /// Serial-polls for service requests
    InterruptCollector,
    /// Delivers service requests
    InterruptDispatcher,
}

impl TaskKind {
    /// Task name used in logs and spans
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Commands => "commands",
            TaskKind::Status => "status",
            TaskKind::Settings => "settings",
            TaskKind::Reading => "reading",
            TaskKind::InterruptCollector => "interrupt-collector",
            TaskKind::InterruptDispatcher => "interrupt-dispatcher",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of one background task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, not yet looping
    Started,
    /// Looping
    Running,
    /// Exited after cancellation
    Stopped,
    /// Exited after a fatal failure
    Error,
}

/// Construction-time settings of an instrument
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    /// Loop periods
    pub periods: Periods,
    /// Run the interrupt collector and dispatcher
    pub interrupts: bool,
    /// Delay after a failed interrupt collection cycle
    pub error_penalty: Duration,
    /// Whether the channel permit may be replaced
    pub permit_policy: PermitPolicy,
}

impl InstrumentOptions {
    /// Options with the given periods and defaults for everything else
    pub fn new(periods: Periods) -> Self {
        Self {
            periods,
            interrupts: true,
            error_penalty: DEFAULT_ERROR_PENALTY,
            permit_policy: PermitPolicy::default(),
        }
    }

    /// Options from an `[[instruments]]` entry
    ///
    /// Configured periods override the driver defaults. The interrupt period
    /// falls back to `bus.interrupt_period` unless the driver disables
    /// interrupt collection.
    pub fn from_config(config: &InstrumentConfig, bus: &BusConfig, defaults: Periods) -> Result<Self> {
        let period = |configured: Option<f64>, fallback: Option<Duration>| -> Result<Option<Duration>> {
            match configured {
                Some(seconds) => Ok(Some(period_from_secs(seconds)?)),
                None => Ok(fallback),
            }
        };
        let interrupt_fallback = match defaults.interrupt {
            Some(_) => Some(period_from_secs(bus.interrupt_period)?),
            None => None,
        };
        Ok(Self {
            periods: Periods {
                status: period(config.status_period, defaults.status)?,
                settings: period(config.settings_period, defaults.settings)?,
                reading: period(config.reading_period, defaults.reading)?,
                interrupt: period(config.interrupt_period, interrupt_fallback)?,
            },
            interrupts: config.interrupts,
            error_penalty: bus.error_penalty(),
            permit_policy: PermitPolicy::from_replaceable(config.replaceable_permit),
        })
    }
}

struct InstrumentInner<D: InstrumentDriver> {
    name: Arc<str>,
    driver: D,
    device: Device,
    options: InstrumentOptions,
    service: ServiceCell,
    commands: mpsc::UnboundedSender<D::Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<D::Command>>>,
    depth: AtomicUsize,
    status: RwLock<Option<Sample<D::Status>>>,
    settings: RwLock<Option<Sample<D::Settings>>>,
    reading: RwLock<Option<Sample<D::Reading>>>,
    status_listeners: ListenerSet<Sample<D::Status>>,
    settings_listeners: ListenerSet<Sample<D::Settings>>,
    reading_listeners: ListenerSet<Sample<D::Reading>>,
    interrupt_listeners: ListenerSet<StatusByte>,
    permit: Arc<PermitSlot>,
    cancel: CancellationToken,
    task_states: Mutex<HashMap<TaskKind, TaskState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start_lock: tokio::sync::Mutex<()>,
}

fn store<T: Clone>(slot: &RwLock<Option<Sample<T>>>, sample: &Sample<T>) {
    *slot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sample.clone());
}

fn load<T: Clone>(slot: &RwLock<Option<Sample<T>>>) -> Option<Sample<T>> {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

impl<D: InstrumentDriver> InstrumentInner<D> {
    fn context(&self) -> InstrumentContext {
        InstrumentContext::new(
            self.name.clone(),
            self.device.clone(),
            self.permit.clone(),
            self.cancel.clone(),
        )
    }

    fn set_task_state(&self, kind: TaskKind, state: TaskState) {
        trace!(task = %kind, ?state, "Task state");
        self.task_states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, state);
    }

    /// Fatal failure of `kind`: the instrument enters ERROR and every task stops
    fn fail(&self, kind: TaskKind, error: &Error) {
        self.set_task_state(kind, TaskState::Error);
        self.service.fail(format!("{} task failed: {}", kind, error));
        self.cancel.cancel();
    }

    fn spawn<F>(&self, kind: TaskKind, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.set_task_state(kind, TaskState::Started);
        let handle = tokio::spawn(task.instrument(task_span(kind.name(), &self.name)));
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// One acquisition cycle for an acquisition task
    async fn acquire(&self, kind: TaskKind, ctx: &InstrumentContext) -> Result<()> {
        match kind {
            TaskKind::Status => {
                let sample = Sample::now(self.driver.read_status(ctx).await?);
                store(&self.status, &sample);
                self.status_listeners.notify(&sample);
            }
            TaskKind::Settings => {
                let sample = Sample::now(self.driver.read_settings(ctx).await?);
                store(&self.settings, &sample);
                self.settings_listeners.notify(&sample);
            }
            TaskKind::Reading => {
                let sample = Sample::now(self.driver.read_reading(ctx).await?);
                store(&self.reading, &sample);
                self.reading_listeners.notify(&sample);
            }
            other => {
                return Err(Error::core(format!("{} is not an acquisition task", other)));
            }
        }
        Ok(())
    }

    /// Serial-poll once, unless someone holds the channel permit
    async fn poll_once(&self) -> Result<Option<StatusByte>> {
        let _guard = match self.permit.current() {
            Some(permit) => match permit.try_acquire() {
                Some(guard) => Some(guard),
                None => {
                    trace!("Channel permit held, skipping poll");
                    return Ok(None);
                }
            },
            None => None,
        };
        Ok(Some(self.device.serial_poll().await?))
    }
}

async fn command_worker<D: InstrumentDriver>(
    inner: Arc<InstrumentInner<D>>,
    mut commands: mpsc::UnboundedReceiver<D::Command>,
) {
    let kind = TaskKind::Commands;
    inner.set_task_state(kind, TaskState::Running);
    let ctx = inner.context();
    loop {
        let command = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            next = commands.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };
        inner.depth.fetch_sub(1, Ordering::SeqCst);
        trace!(?command, "Processing command");

        match inner.driver.process_command(&ctx, command).await {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => break,
            Err(e) if e.kind() == ErrorKind::Unsupported => {
                warn!("Command not supported: {}", e);
            }
            Err(e) if e.is_fatal() => {
                inner.fail(kind, &e);
                return;
            }
            Err(e) => warn!(kind = %e.kind(), "Command failed: {}", e),
        }
    }
    inner.set_task_state(kind, TaskState::Stopped);
}

async fn acquisition_loop<D: InstrumentDriver>(inner: Arc<InstrumentInner<D>>, kind: TaskKind, period: Duration) {
    inner.set_task_state(kind, TaskState::Running);
    let ctx = inner.context();
    while !inner.cancel.is_cancelled() {
        let started = Instant::now();
        match inner.acquire(kind, &ctx).await {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => break,
            Err(e) if e.is_fatal() => {
                inner.fail(kind, &e);
                return;
            }
            Err(e) => warn!(kind = %e.kind(), "Acquisition failed: {}", e),
        }
        if !sleep_remaining(kind.name(), period, started, &inner.cancel).await {
            break;
        }
    }
    inner.set_task_state(kind, TaskState::Stopped);
}

async fn interrupt_collector<D: InstrumentDriver>(
    inner: Arc<InstrumentInner<D>>,
    period: Duration,
    interrupts: mpsc::UnboundedSender<StatusByte>,
) {
    let kind = TaskKind::InterruptCollector;
    inner.set_task_state(kind, TaskState::Running);
    while !inner.cancel.is_cancelled() {
        let started = Instant::now();
        match inner.poll_once().await {
            Ok(Some(status)) if status.requests_service() => {
                debug!(%status, "Service requested");
                if interrupts.send(status).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) if e.is_interrupted() => break,
            Err(e) if e.is_fatal() => {
                inner.fail(kind, &e);
                return;
            }
            Err(e) => {
                warn!(kind = %e.kind(), penalty = ?inner.options.error_penalty, "Serial poll failed: {}", e);
                if !sleep_or_cancel(inner.options.error_penalty, &inner.cancel).await {
                    break;
                }
                continue;
            }
        }
        if !sleep_remaining(kind.name(), period, started, &inner.cancel).await {
            break;
        }
    }
    inner.set_task_state(kind, TaskState::Stopped);
}

async fn interrupt_dispatcher<D: InstrumentDriver>(
    inner: Arc<InstrumentInner<D>>,
    mut interrupts: mpsc::UnboundedReceiver<StatusByte>,
) {
    let kind = TaskKind::InterruptDispatcher;
    inner.set_task_state(kind, TaskState::Running);
    let ctx = inner.context();
    loop {
        let status = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            next = interrupts.recv() => match next {
                Some(status) => status,
                None => break,
            },
        };
        inner.interrupt_listeners.notify(&status);
        match inner.driver.on_interrupt(&ctx, status).await {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => break,
            Err(e) => warn!(%status, "Interrupt handler failed: {}", e),
        }
    }
    inner.set_task_state(kind, TaskState::Stopped);
}

/// One instrument on the bus, driven by `D`
pub struct Instrument<D: InstrumentDriver> {
    inner: Arc<InstrumentInner<D>>,
}

impl<D: InstrumentDriver> Clone for Instrument<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: InstrumentDriver> fmt::Debug for Instrument<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.inner.name)
            .field("model", &self.inner.driver.model())
            .field("device", &self.inner.device)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: InstrumentDriver> Instrument<D> {
    /// Create a stopped instrument using the driver's default periods
    pub fn new<S: Into<String>>(name: S, driver: D, device: Device) -> Self {
        let options = InstrumentOptions::new(driver.default_periods());
        Self::with_options(name, driver, device, options)
    }

    /// Create a stopped instrument with explicit options
    pub fn with_options<S: Into<String>>(name: S, driver: D, device: Device, options: InstrumentOptions) -> Self {
        let name: String = name.into();
        let (commands, pending) = mpsc::unbounded_channel();
        let permit = Arc::new(PermitSlot::new(options.permit_policy));
        Self {
            inner: Arc::new(InstrumentInner {
                service: ServiceCell::new(name.clone()),
                name: Arc::from(name),
                driver,
                device,
                options,
                commands,
                pending: Mutex::new(Some(pending)),
                depth: AtomicUsize::new(0),
                status: RwLock::new(None),
                settings: RwLock::new(None),
                reading: RwLock::new(None),
                status_listeners: ListenerSet::new(),
                settings_listeners: ListenerSet::new(),
                reading_listeners: ListenerSet::new(),
                interrupt_listeners: ListenerSet::new(),
                permit,
                cancel: CancellationToken::new(),
                task_states: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                start_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a stopped instrument from an `[[instruments]]` entry
    pub fn from_config(driver: D, device: Device, config: &InstrumentConfig, bus: &BusConfig) -> Result<Self> {
        let options = InstrumentOptions::from_config(config, bus, driver.default_periods())?;
        Ok(Self::with_options(config.name.clone(), driver, device, options))
    }

    /// Instrument name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The driver
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// The device
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Construction-time options
    pub fn options(&self) -> &InstrumentOptions {
        &self.inner.options
    }

    /// Driver context, for running sequences outside the command queue
    pub fn context(&self) -> InstrumentContext {
        self.inner.context()
    }

    /// Lifecycle state; `ERROR` whenever the device's controller is in `ERROR`
    pub fn state(&self) -> ServiceState {
        match self.inner.device.state() {
            ServiceState::Error => ServiceState::Error,
            _ => self.inner.service.state(),
        }
    }

    /// Watch the instrument's own lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.service.subscribe()
    }

    /// State of a background task; `None` if it was never spawned
    pub fn task_state(&self, kind: TaskKind) -> Option<TaskState> {
        self.inner
            .task_states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .copied()
    }

    /// Queue a command for the driver; never blocks
    pub fn add_command(&self, command: D::Command) -> Result<()> {
        let state = self.state();
        if state == ServiceState::Error || self.inner.cancel.is_cancelled() {
            return Err(BusError::inactive(self.name(), state).into());
        }
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        if self.inner.commands.send(command).is_err() {
            self.inner.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::inactive(self.name(), self.state()).into());
        }
        Ok(())
    }

    /// Commands waiting for the command worker
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// Last acquired status
    pub fn status(&self) -> Option<Sample<D::Status>> {
        load(&self.inner.status)
    }

    /// Last acquired settings
    pub fn settings(&self) -> Option<Sample<D::Settings>> {
        load(&self.inner.settings)
    }

    /// Last acquired reading
    pub fn reading(&self) -> Option<Sample<D::Reading>> {
        load(&self.inner.reading)
    }

    /// Register a status listener
    pub fn add_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Sample<D::Status>) + Send + Sync + 'static,
    {
        self.inner.status_listeners.add(listener)
    }

    /// Unregister a status listener
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.status_listeners.remove(id)
    }

    /// Register a settings listener
    pub fn add_settings_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Sample<D::Settings>) + Send + Sync + 'static,
    {
        self.inner.settings_listeners.add(listener)
    }

    /// Unregister a settings listener
    pub fn remove_settings_listener(&self, id: ListenerId) -> bool {
        self.inner.settings_listeners.remove(id)
    }

    /// Register a reading listener
    pub fn add_reading_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Sample<D::Reading>) + Send + Sync + 'static,
    {
        self.inner.reading_listeners.add(listener)
    }

    /// Unregister a reading listener
    pub fn remove_reading_listener(&self, id: ListenerId) -> bool {
        self.inner.reading_listeners.remove(id)
    }

    /// Stream of readings, for consumers that prefer a channel to a callback
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Sample<D::Reading>> {
        self.inner.reading_listeners.subscribe()
    }

    /// Register a service request listener
    pub fn add_interrupt_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StatusByte) + Send + Sync + 'static,
    {
        self.inner.interrupt_listeners.add(listener)
    }

    /// Unregister a service request listener
    pub fn remove_interrupt_listener(&self, id: ListenerId) -> bool {
        self.inner.interrupt_listeners.remove(id)
    }

    /// Install the channel-access permit, subject to the permit policy
    pub fn install_permit(&self, permit: ChannelPermit) -> Result<()> {
        self.inner.permit.install(permit)
    }

    /// Installed channel-access permit
    pub fn permit(&self) -> Option<ChannelPermit> {
        self.inner.permit.current()
    }

    /// Start the device's controller if needed, then every background task
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.start_lock.lock().await;
        if inner.cancel.is_cancelled() {
            return Err(Error::core(format!("{} has been stopped", inner.name)));
        }
        inner.service.begin_start()?;

        if let Err(e) = inner.device.start().await {
            inner.service.fail(format!("device failed to start: {}", e));
            return Err(e.into());
        }

        let commands = inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::core(format!("{} has no command queue", inner.name)))?;

        inner.service.activate();
        inner.spawn(TaskKind::Commands, command_worker(inner.clone(), commands));

        let periods = inner.options.periods;
        for (kind, period) in [
            (TaskKind::Status, periods.status),
            (TaskKind::Settings, periods.settings),
            (TaskKind::Reading, periods.reading),
        ] {
            if let Some(period) = period {
                inner.spawn(kind, acquisition_loop(inner.clone(), kind, period));
            }
        }

        match periods.interrupt {
            Some(period) if inner.options.interrupts => {
                let (tx, rx) = mpsc::unbounded_channel();
                inner.spawn(
                    TaskKind::InterruptCollector,
                    interrupt_collector(inner.clone(), period, tx),
                );
                inner.spawn(TaskKind::InterruptDispatcher, interrupt_dispatcher(inner.clone(), rx));
            }
            _ => debug!(instrument = %inner.name, "Interrupt collection disabled"),
        }

        info!(
            instrument = %inner.name,
            model = inner.driver.model(),
            device = %inner.device.url(),
            "Instrument started"
        );
        Ok(())
    }

    /// Cancel and join every background task
    ///
    /// The controller is left running since other devices may share it.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!(instrument = %self.inner.name, "Task ended abnormally: {}", e);
            }
        }
        self.inner.service.stop();
        info!(instrument = %self.inner.name, state = %self.state(), "Instrument stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::Bytes;
    use labbus_devices::address::BusAddress;
    use labbus_devices::command::ChannelOp;
    use labbus_devices::controller::Controller;
    use labbus_devices::mock::{MockBus, MockOp};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug)]
    enum TestCommand {
        Set(u32),
        Unsupported,
    }

    #[derive(Default)]
    struct TestDriver {
        processed: Arc<Mutex<Vec<u32>>>,
        interrupts: Arc<Mutex<Vec<StatusByte>>>,
        failing_handler: bool,
    }

    #[async_trait]
    impl InstrumentDriver for TestDriver {
        type Command = TestCommand;
        type Status = String;
        type Settings = String;
        type Reading = f64;

        fn model(&self) -> &str {
            "TEST-1"
        }

        async fn process_command(&self, ctx: &InstrumentContext, command: TestCommand) -> Result<()> {
            match command {
                TestCommand::Set(value) => {
                    ctx.send(format!("SET {}\n", value)).await?;
                    self.processed.lock().unwrap().push(value);
                    Ok(())
                }
                TestCommand::Unsupported => Err(Error::unsupported("TEST-1 cannot do that")),
            }
        }

        async fn on_interrupt(&self, _ctx: &InstrumentContext, status: StatusByte) -> Result<()> {
            self.interrupts.lock().unwrap().push(status);
            if self.failing_handler {
                Err(Error::decode("handler broke"))
            } else {
                Ok(())
            }
        }

        async fn read_status(&self, ctx: &InstrumentContext) -> Result<String> {
            ctx.query("STAT?\n").await
        }

        async fn read_reading(&self, ctx: &InstrumentContext) -> Result<f64> {
            Ok(ctx.query("READ?\n").await?.trim().parse()?)
        }
    }

    fn no_loops() -> Periods {
        Periods {
            status: None,
            settings: None,
            reading: None,
            interrupt: None,
        }
    }

    fn instrument(bus: &MockBus, driver: TestDriver, periods: Periods) -> Instrument<TestDriver> {
        let device = Device::new(
            Controller::new("bench", bus.connector()),
            BusAddress::primary_only(5).unwrap(),
        )
        .with_timeout(Duration::from_millis(500));
        let mut options = InstrumentOptions::new(periods);
        options.error_penalty = Duration::from_millis(20);
        Instrument::with_options("probe", driver, device, options)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_acquisition_publishes_and_caches() {
        let bus = MockBus::new();
        bus.respond(5, b"STAT?\n", b"IDLE\n").respond(5, b"READ?\n", b"1.5\n");
        let periods = Periods {
            status: Some(Duration::from_millis(20)),
            reading: Some(Duration::from_millis(20)),
            ..no_loops()
        };
        let instrument = instrument(&bus, TestDriver::default(), periods);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = instrument.add_reading_listener(move |sample| {
            let _ = tx.send(sample.value);
        });
        instrument.start().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(1.5));
        assert!(wait_until(|| instrument.status().is_some()).await);
        assert_eq!(instrument.status().unwrap().value, "IDLE");
        assert_eq!(instrument.task_state(TaskKind::Status), Some(TaskState::Running));
        assert_eq!(instrument.task_state(TaskKind::Settings), None);
        assert!(instrument.remove_reading_listener(listener));

        instrument.stop().await;
        assert_eq!(instrument.state(), ServiceState::Stopped);
        assert_eq!(instrument.task_state(TaskKind::Status), Some(TaskState::Stopped));
        assert_eq!(instrument.task_state(TaskKind::Commands), Some(TaskState::Stopped));
    }

    #[tokio::test]
    async fn test_malformed_reading_is_not_fatal() {
        let bus = MockBus::new();
        bus.respond(5, b"READ?\n", b"overload\n");
        let periods = Periods {
            reading: Some(Duration::from_millis(10)),
            ..no_loops()
        };
        let instrument = instrument(&bus, TestDriver::default(), periods);
        instrument.start().await.unwrap();

        assert!(wait_until(|| bus.writes_to(5).len() >= 3).await);
        assert_eq!(instrument.state(), ServiceState::Active);
        assert!(instrument.reading().is_none());
        instrument.stop().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_io_failure_escalates() {
        let bus = MockBus::new();
        bus.respond(5, b"STAT?\n", b"IDLE\n");
        let periods = Periods {
            status: Some(Duration::from_millis(10)),
            ..no_loops()
        };
        let instrument = instrument(&bus, TestDriver::default(), periods);
        instrument.start().await.unwrap();
        assert!(wait_until(|| instrument.status().is_some()).await);

        bus.fail_next(BusError::io("bridge unplugged"));
        assert!(wait_until(|| instrument.task_state(TaskKind::Commands) == Some(TaskState::Stopped)).await);

        assert_eq!(instrument.state(), ServiceState::Error);
        assert_eq!(instrument.task_state(TaskKind::Status), Some(TaskState::Error));
        assert!(instrument.add_command(TestCommand::Set(1)).is_err());

        instrument.stop().await;
        assert_eq!(instrument.state(), ServiceState::Error);
    }

    #[tokio::test]
    async fn test_unsupported_loop_is_fatal_but_controller_survives() {
        let bus = MockBus::new();
        let periods = Periods {
            settings: Some(Duration::from_millis(10)),
            ..no_loops()
        };
        let instrument = instrument(&bus, TestDriver::default(), periods);
        instrument.start().await.unwrap();

        assert!(wait_until(|| instrument.state() == ServiceState::Error).await);
        assert_eq!(instrument.task_state(TaskKind::Settings), Some(TaskState::Error));
        assert_eq!(instrument.device().state(), ServiceState::Active);
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_command_queue() {
        let bus = MockBus::new();
        let driver = TestDriver::default();
        let processed = driver.processed.clone();
        let instrument = instrument(&bus, driver, no_loops());

        instrument.add_command(TestCommand::Set(1)).unwrap();
        instrument.add_command(TestCommand::Unsupported).unwrap();
        instrument.add_command(TestCommand::Set(2)).unwrap();
        assert_eq!(instrument.queue_depth(), 3);

        instrument.start().await.unwrap();
        assert!(wait_until(|| processed.lock().unwrap().len() == 2).await);

        assert_eq!(*processed.lock().unwrap(), vec![1, 2]);
        assert_eq!(bus.writes_to(5), vec![b"SET 1\n".to_vec(), b"SET 2\n".to_vec()]);
        assert_eq!(instrument.queue_depth(), 0);
        assert_eq!(instrument.state(), ServiceState::Active);
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_interrupts_are_dispatched_and_handler_errors_swallowed() {
        let bus = MockBus::new();
        bus.queue_polls(5, [0x00, 0x41, 0x00, 0x50]).set_poll(5, 0x00);
        let driver = TestDriver {
            failing_handler: true,
            ..Default::default()
        };
        let handled = driver.interrupts.clone();
        let periods = Periods {
            interrupt: Some(Duration::from_millis(10)),
            ..no_loops()
        };
        let instrument = instrument(&bus, driver, periods);

        let (tx, mut rx) = mpsc::unbounded_channel();
        instrument.add_interrupt_listener(move |status| {
            let _ = tx.send(*status);
        });
        instrument.start().await.unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(tokio::time::timeout(timeout, rx.recv()).await.unwrap(), Some(StatusByte(0x41)));
        assert_eq!(tokio::time::timeout(timeout, rx.recv()).await.unwrap(), Some(StatusByte(0x50)));
        assert!(wait_until(|| handled.lock().unwrap().len() == 2).await);
        assert_eq!(instrument.state(), ServiceState::Active);
        assert_eq!(instrument.task_state(TaskKind::InterruptDispatcher), Some(TaskState::Running));
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_poll_timeouts_are_penalized_not_fatal() {
        let bus = MockBus::new();
        let periods = Periods {
            interrupt: Some(Duration::from_millis(5)),
            ..no_loops()
        };
        let instrument = instrument(&bus, TestDriver::default(), periods);
        instrument.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let polls = bus.poll_count(5);
        assert!(polls >= 1);
        // 20 ms penalty per failed cycle instead of the 5 ms period
        assert!(polls <= 8, "expected penalized polling, got {} polls", polls);
        assert_eq!(instrument.state(), ServiceState::Active);
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_exclusive_sequence_keeps_polls_out() {
        let bus = MockBus::new();
        bus.set_poll(5, 0x00)
            .set_delay(Duration::from_millis(25))
            .set_poll_delay(Duration::from_millis(1));
        let periods = Periods {
            interrupt: Some(Duration::from_millis(10)),
            ..no_loops()
        };
        let instrument = instrument(&bus, TestDriver::default(), periods);
        instrument.install_permit(ChannelPermit::new()).unwrap();
        instrument.start().await.unwrap();
        assert!(wait_until(|| bus.poll_count(5) >= 2).await);

        let ops: Vec<ChannelOp> = ["A\n", "B\n", "C\n", "D\n"]
            .into_iter()
            .map(|data| ChannelOp::Write { data: Bytes::from_static(data.as_bytes()) })
            .collect();
        instrument
            .context()
            .atomic_sequence_exclusive(ops, Duration::from_secs(2))
            .await
            .unwrap();
        let polls_after_sequence = bus.poll_count(5);
        assert!(wait_until(|| bus.poll_count(5) > polls_after_sequence + 1).await);

        let log = bus.log();
        let window_start = log
            .iter()
            .find(|r| r.op == MockOp::Write(BusAddress::primary_only(5).unwrap(), b"A\n".to_vec()))
            .map(|r| r.started)
            .unwrap();
        let window_end = log
            .iter()
            .find(|r| r.op == MockOp::Write(BusAddress::primary_only(5).unwrap(), b"D\n".to_vec()))
            .map(|r| r.finished)
            .unwrap();
        let polls_in_window = log
            .iter()
            .filter(|r| matches!(r.op, MockOp::SerialPoll(_)))
            .filter(|r| r.started >= window_start && r.started <= window_end)
            .count();
        assert_eq!(polls_in_window, 0);
        assert_eq!(bus.overlaps(), 0);
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_permit_policy() {
        let bus = MockBus::new();
        let once = instrument(&bus, TestDriver::default(), no_loops());
        let shared = ChannelPermit::new();
        once.install_permit(shared.clone()).unwrap();
        assert!(once.install_permit(ChannelPermit::new()).is_err());
        assert!(once.permit().unwrap().same_as(&shared));

        let device = once.device().clone();
        let mut options = InstrumentOptions::new(no_loops());
        options.permit_policy = PermitPolicy::Replaceable;
        let replaceable = Instrument::with_options("other", TestDriver::default(), device, options);
        replaceable.install_permit(shared).unwrap();
        let fresh = ChannelPermit::new();
        replaceable.install_permit(fresh.clone()).unwrap();
        assert!(replaceable.permit().unwrap().same_as(&fresh));
    }

    #[tokio::test]
    async fn test_start_once() {
        let bus = MockBus::new();
        let instrument = instrument(&bus, TestDriver::default(), no_loops());
        assert_ok!(instrument.start().await);
        assert_err!(instrument.start().await);

        instrument.stop().await;
        assert_eq!(instrument.state(), ServiceState::Stopped);
        assert_err!(instrument.add_command(TestCommand::Set(3)));
        assert_err!(instrument.start().await);
    }

    #[tokio::test]
    async fn test_start_fails_when_controller_cannot_connect() {
        let bus = MockBus::new();
        bus.fail_connect(BusError::io("no route to host"));
        let instrument = instrument(&bus, TestDriver::default(), no_loops());
        assert!(instrument.start().await.is_err());
        assert_eq!(instrument.state(), ServiceState::Error);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = InstrumentConfig::new("dmm", "bench", 22);
        config.status_period = Some(0.25);
        config.replaceable_permit = true;
        let bus = BusConfig::default();
        let defaults = Periods {
            reading: Some(Duration::from_secs(1)),
            ..Periods::default()
        };

        let options = InstrumentOptions::from_config(&config, &bus, defaults).unwrap();
        assert_eq!(options.periods.status, Some(Duration::from_millis(250)));
        assert_eq!(options.periods.settings, None);
        assert_eq!(options.periods.reading, Some(Duration::from_secs(1)));
        assert_eq!(options.periods.interrupt, Some(Duration::from_millis(100)));
        assert_eq!(options.permit_policy, PermitPolicy::Replaceable);
        assert_eq!(options.error_penalty, bus.error_penalty());

        config.reading_period = Some(-1.0);
        assert!(InstrumentOptions::from_config(&config, &bus, defaults).is_err());
    }
}
