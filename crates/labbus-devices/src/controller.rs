/*!
 * Bus controller.
 *
 * A controller owns one connection to the bus and serializes every command
 * sent to it: commands are queued FIFO by `submit` and executed one at a time
 * by a single worker task. A separate supervisory task opens the channel,
 * runs the worker and closes the channel when the worker is done.
 *
 * Lifecycle: `STOPPED -> ACTIVE -> (ERROR | STOPPED)`. An I/O failure on the
 * channel is fatal: the failing command is completed and its listeners are
 * notified, then the controller enters `ERROR`, the worker exits and any
 * queued commands are abandoned.
 */
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use labbus_core::event::{ListenerId, ListenerSet};
use labbus_core::logging::{component_span, task_span};
use labbus_core::service::{ServiceCell, ServiceState};

use crate::channel::{self, BusChannel, ChannelConnector};
use crate::command::{CommandId, TransportCommand};
use crate::error::{BusError, ErrorKind, Result};

/// Delivered to completion listeners once per executed command
#[derive(Debug, Clone)]
pub struct Completion {
    /// Name of the controller that ran the command
    pub controller: Arc<str>,
    /// The completed command, with its outcome recorded
    pub command: Arc<TransportCommand>,
}

type Queue = mpsc::UnboundedReceiver<Arc<TransportCommand>>;

struct ControllerInner {
    service: ServiceCell,
    name: Arc<str>,
    connector: Box<dyn ChannelConnector>,
    queue: mpsc::UnboundedSender<Arc<TransportCommand>>,
    pending: Mutex<Option<Queue>>,
    depth: AtomicUsize,
    listeners: ListenerSet<Completion>,
    cancel: CancellationToken,
    start_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Serializes commands onto one bus channel
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.connector.endpoint())
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

impl Controller {
    /// Create a stopped controller that will connect through `connector`
    pub fn new<S, C>(name: S, connector: C) -> Self
    where
        S: Into<String>,
        C: ChannelConnector + 'static,
    {
        let name: String = name.into();
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ControllerInner {
                service: ServiceCell::new(name.clone()),
                name: Arc::from(name),
                connector: Box::new(connector),
                queue,
                pending: Mutex::new(Some(pending)),
                depth: AtomicUsize::new(0),
                listeners: ListenerSet::new(),
                cancel: CancellationToken::new(),
                start_lock: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Controller name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        self.inner.service.state()
    }

    /// Whether `start` has ever been called successfully
    pub fn has_started(&self) -> bool {
        self.inner.service.has_started()
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.service.subscribe()
    }

    /// Commands queued but not yet picked up by the worker
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// Number of registered completion listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Register a completion listener
    ///
    /// Listeners run on the worker task, so they must return quickly.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Completion) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    /// Unregister a completion listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Queue a command; never blocks
    ///
    /// Commands submitted before `start` run once the controller is active.
    /// Once the controller has failed or been stopped, submissions are
    /// rejected with [`BusError::Inactive`].
    pub fn submit(&self, command: TransportCommand) -> Result<CommandId> {
        self.submit_shared(Arc::new(command))
    }

    /// Queue a command that the caller keeps a handle to
    pub fn submit_shared(&self, command: Arc<TransportCommand>) -> Result<CommandId> {
        let state = self.state();
        if state == ServiceState::Error || self.inner.cancel.is_cancelled() {
            return Err(BusError::inactive(self.name(), state));
        }
        let id = command.id();
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        if self.inner.queue.send(command).is_err() {
            self.inner.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::inactive(self.name(), self.state()));
        }
        debug!(controller = %self.name(), %id, "Command queued");
        Ok(id)
    }

    /// Connect, initialize the channel and start the worker
    ///
    /// Calling `start` again while the controller is active is a no-op, so
    /// several devices sharing a controller may all start it.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.start_lock.lock().await;
        if self.inner.service.has_started() {
            return match self.state() {
                ServiceState::Active => Ok(()),
                state => Err(BusError::inactive(self.name(), state)),
            };
        }
        self.inner.service.begin_start()?;

        let queue = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| BusError::inactive(self.name(), self.state()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let span = component_span("controller", Some(self.name()));
        let handle = tokio::spawn(supervise(self.inner.clone(), queue, ready_tx).instrument(span));
        *self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => {
                self.inner.service.fail("supervisor exited before reporting readiness");
                Err(BusError::io(format!("{} failed to start", self.name())))
            }
        }
    }

    /// Stop the worker and close the channel
    ///
    /// A command being executed is allowed to finish; queued commands are
    /// abandoned. A controller in `ERROR` stays there.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(controller = %self.name(), "Supervisor task failed: {}", e);
                self.inner.service.fail(format!("supervisor task failed: {}", e));
            }
        }
        self.inner.service.stop();
    }

    /// Wait until the controller reaches `state`
    pub async fn wait_for(&self, state: ServiceState) -> ServiceState {
        self.inner.service.wait_for(state).await
    }
}

async fn supervise(
    inner: Arc<ControllerInner>,
    queue: Queue,
    ready: oneshot::Sender<Result<()>>,
) {
    let endpoint = inner.connector.endpoint();
    info!(%endpoint, "Connecting");

    let mut channel = match inner.connector.connect().await {
        Ok(channel) => channel,
        Err(e) => {
            inner.service.fail(format!("connect to {} failed: {}", endpoint, e));
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = channel.initialize().await {
        inner.service.fail(format!("channel initialization failed: {}", e));
        if let Err(close_err) = channel.close().await {
            warn!("Failed to close channel: {}", close_err);
        }
        let _ = ready.send(Err(e));
        return;
    }

    inner.service.activate();
    let _ = ready.send(Ok(()));

    let worker_span = task_span("worker", &inner.name);
    let mut worker = tokio::spawn(run_worker(inner.clone(), channel, queue).instrument(worker_span));

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = inner.cancel.cancelled() => {
            debug!("Stop requested, waiting for worker");
            worker.await
        }
    };

    match joined {
        Ok(mut channel) => {
            if let Err(e) = channel.close().await {
                warn!("Failed to close channel: {}", e);
            }
            info!(%endpoint, "Channel closed");
        }
        Err(e) => {
            inner.service.fail(format!("worker task failed: {}", e));
        }
    }
}

async fn run_worker(
    inner: Arc<ControllerInner>,
    mut channel: Box<dyn BusChannel>,
    mut queue: Queue,
) -> Box<dyn BusChannel> {
    debug!("Worker running");
    loop {
        let command = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };
        inner.depth.fetch_sub(1, Ordering::SeqCst);

        if command.is_complete() {
            debug!(id = %command.id(), "Skipping command completed while queued");
            inner.listeners.notify(&Completion {
                controller: inner.name.clone(),
                command: command.clone(),
            });
            continue;
        }

        let outcome = match command.validate() {
            Ok(()) => channel::execute(channel.as_mut(), &command).await,
            Err(e) => Err(e),
        };

        let fatal = match &outcome {
            Err(e) if e.kind() == ErrorKind::Io => Some(e.clone()),
            Err(e) => {
                debug!(id = %command.id(), kind = %e.kind(), "Command failed: {}", e);
                None
            }
            Ok(_) => None,
        };

        command.complete(outcome);
        inner.listeners.notify(&Completion {
            controller: inner.name.clone(),
            command: command.clone(),
        });

        if let Some(e) = fatal {
            inner.service.fail(format!("{} failed: {}", command.id(), e));
            let abandoned = inner.depth.load(Ordering::SeqCst);
            if abandoned > 0 {
                warn!(abandoned, "Queued commands abandoned");
            }
            break;
        }
    }
    debug!("Worker exiting");
    channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::address::BusAddress;
    use crate::command::{ChannelOp, CommandKind, CommandResult, Terminator};
    use crate::mock::{MockBus, MockOp};
    use tokio_test::assert_err;

    fn addr(primary: u8) -> BusAddress {
        BusAddress::primary_only(primary).unwrap()
    }

    fn write(primary: u8, data: &'static [u8]) -> TransportCommand {
        TransportCommand::addressed(addr(primary), ChannelOp::Write { data: Bytes::from_static(data) })
    }

    fn collect(controller: &Controller) -> mpsc::UnboundedReceiver<Completion> {
        let (tx, rx) = mpsc::unbounded_channel();
        controller.add_listener(move |c| {
            let _ = tx.send(c.clone());
        });
        rx
    }

    async fn take(rx: &mut mpsc::UnboundedReceiver<Completion>, count: usize) -> Vec<Completion> {
        let mut seen = Vec::new();
        while seen.len() < count {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(c)) => seen.push(c),
                _ => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_fifo_order_and_single_flight() {
        let bus = MockBus::new();
        bus.set_delay(Duration::from_millis(2));
        let controller = Controller::new("bridge", bus.connector());

        let mut ids = Vec::new();
        for payload in [&b"A"[..], b"B", b"C", b"D", b"E"] {
            ids.push(
                controller
                    .submit(TransportCommand::addressed(
                        addr(4),
                        ChannelOp::Write { data: Bytes::from_static(payload) },
                    ))
                    .unwrap(),
            );
        }
        assert_eq!(controller.queue_depth(), 5);

        let mut rx = collect(&controller);
        controller.start().await.unwrap();

        let seen = take(&mut rx, 5).await;
        let seen_ids: Vec<CommandId> = seen.iter().map(|c| c.command.id()).collect();
        assert_eq!(seen_ids, ids);
        assert_eq!(
            bus.writes_to(4),
            vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec(), b"D".to_vec(), b"E".to_vec()]
        );
        assert_eq!(bus.overlaps(), 0);
        assert_eq!(controller.queue_depth(), 0);

        controller.stop().await;
        assert_eq!(controller.state(), ServiceState::Stopped);
        assert!(bus.closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_order_across_submitting_tasks() {
        let bus = MockBus::new();
        bus.set_delay(Duration::from_millis(1));
        let controller = Controller::new("bridge", bus.connector());
        let mut rx = collect(&controller);
        controller.start().await.unwrap();

        // Queue order is the order in which `submit` returned under this lock
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for task in 0..4u8 {
            let controller = controller.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    {
                        let mut order = order.lock().unwrap();
                        let id = controller.submit(write(task + 1, b"X")).unwrap();
                        order.push(id);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let seen = take(&mut rx, 20).await;
        let seen_ids: Vec<CommandId> = seen.iter().map(|c| c.command.id()).collect();
        assert_eq!(seen_ids, *order.lock().unwrap());
        assert_eq!(bus.overlaps(), 0);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_completed_command_is_skipped() {
        let bus = MockBus::new();
        let controller = Controller::new("bridge", bus.connector());
        let mut rx = collect(&controller);

        let abandoned = Arc::new(write(2, b"GONE"));
        controller.submit_shared(abandoned.clone()).unwrap();
        controller.submit(write(2, b"KEPT")).unwrap();
        assert!(abandoned.complete(Err(BusError::timeout("caller gave up"))));
        controller.start().await.unwrap();

        let seen = take(&mut rx, 2).await;
        assert_eq!(seen.len(), 2);
        assert!(seen[0].command.result().unwrap_err().is_timeout());
        assert_eq!(bus.writes_to(2), vec![b"KEPT".to_vec()]);
        assert_eq!(controller.state(), ServiceState::Active);
    }

    #[tokio::test]
    async fn test_address_switch_precedes_every_op() {
        let bus = MockBus::new();
        let controller = Controller::new("bridge", bus.connector());
        controller.start().await.unwrap();

        let mut rx = collect(&controller);
        controller.submit(write(3, b"X")).unwrap();
        controller.submit(write(7, b"Y")).unwrap();
        take(&mut rx, 2).await;

        let ops: Vec<MockOp> = bus
            .ops()
            .into_iter()
            .filter(|op| !matches!(op, MockOp::Initialize))
            .collect();
        assert_eq!(
            ops,
            vec![
                MockOp::SwitchAddress(addr(3)),
                MockOp::Write(addr(3), b"X".to_vec()),
                MockOp::SwitchAddress(addr(7)),
                MockOp::Write(addr(7), b"Y".to_vec()),
            ]
        );
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_command_is_recorded_not_fatal() {
        let bus = MockBus::new();
        let controller = Controller::new("bridge", bus.connector());
        controller.start().await.unwrap();

        let mut rx = collect(&controller);
        controller
            .submit(TransportCommand::addressed(addr(1), ChannelOp::ReadN { count: 0 }))
            .unwrap();
        controller.submit(write(1, b"OK")).unwrap();
        let seen = take(&mut rx, 2).await;

        assert_eq!(seen[0].command.result().unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(seen[1].command.result().unwrap(), CommandResult::Done);
        assert_eq!(controller.state(), ServiceState::Active);
        controller.stop().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_io_failure_escalates_to_error() {
        let bus = MockBus::new();
        let controller = Controller::new("bridge", bus.connector());
        controller.start().await.unwrap();

        let mut rx = collect(&controller);
        bus.fail_next(BusError::io("connection reset"));
        controller
            .submit(TransportCommand::addressed(addr(2), ChannelOp::Read { terminator: Terminator::Lf }))
            .unwrap();

        let seen = take(&mut rx, 1).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].command.result().unwrap_err().kind(), ErrorKind::Io);

        assert_eq!(controller.wait_for(ServiceState::Error).await, ServiceState::Error);
        let rejected = controller.submit(write(2, b"X")).unwrap_err();
        assert_eq!(rejected.kind(), ErrorKind::Inactive);
        assert!(controller.start().await.is_err());

        controller.stop().await;
        assert_eq!(controller.state(), ServiceState::Error);
    }

    #[tokio::test]
    async fn test_read_timeout_is_not_fatal() {
        let bus = MockBus::new();
        let controller = Controller::new("bridge", bus.connector());
        controller.start().await.unwrap();

        let mut rx = collect(&controller);
        controller
            .submit(TransportCommand::addressed(addr(2), ChannelOp::Read { terminator: Terminator::Lf }))
            .unwrap();
        let seen = take(&mut rx, 1).await;
        assert!(seen[0].command.result().unwrap_err().is_timeout());
        assert_eq!(controller.state(), ServiceState::Active);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let bus = MockBus::new();
        bus.fail_connect(BusError::io("connection refused"));
        let controller = Controller::new("bridge", bus.connector());

        assert_err!(controller.start().await);
        assert_eq!(controller.state(), ServiceState::Error);
        assert_err!(controller.submit(write(1, b"X")));
    }

    #[tokio::test]
    async fn test_directives_and_repeated_start() {
        let bus = MockBus::new();
        let controller = Controller::new("bridge", bus.connector());
        controller.start().await.unwrap();
        controller.start().await.unwrap();
        assert_eq!(bus.connects(), 1);

        let mut rx = collect(&controller);
        controller.submit(TransportCommand::directive(CommandKind::InterfaceClear)).unwrap();
        controller.submit(TransportCommand::directive(CommandKind::ResetBridge)).unwrap();
        take(&mut rx, 2).await;

        let ops = bus.ops();
        assert!(ops.contains(&MockOp::InterfaceClear));
        assert!(ops.contains(&MockOp::Reset));
        controller.stop().await;
        assert!(controller.submit(write(1, b"X")).is_err());
    }
}
