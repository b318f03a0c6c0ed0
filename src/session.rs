use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{error, trace, warn};
use tokio::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::operation::{Operation, OperationKind, OperationQueue};
use crate::peripheral::Peripheral;
use crate::topology::{ServiceInfo, Topology};
use crate::{CharacteristicHandle, DescriptorHandle, Error, GattError, Result};

/// The lifecycle of a single connection attempt
///
/// `Disconnected` is terminal: a `Session` that reaches it is finished and a
/// new connection attempt means creating a new `Session`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Discovering,
    Operating,
    Disconnected,
}

/// Completion callbacks and unsolicited notifications from a [`Transport`]
///
/// A transport delivers all of these through the single sender it is handed
/// at construction time; the session processes them sequentially, one at a
/// time, which is what makes the one-outstanding-request rule enforceable.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    ConnectionEstablished,
    ConnectionFailed {
        error: Option<GattError>,
    },
    /// The link dropped after it had been established, at any point.
    ConnectionLost {
        error: Option<GattError>,
    },
    DiscoveryComplete {
        services: Vec<ServiceInfo>,
    },
    DiscoveryFailed {
        error: Option<GattError>,
    },
    SubscribeComplete {
        characteristic: CharacteristicHandle,
        result: std::result::Result<(), GattError>,
    },
    ReadComplete {
        characteristic: CharacteristicHandle,
        result: std::result::Result<Vec<u8>, GattError>,
    },
    /// An unsolicited value push for a subscribed characteristic. These are
    /// out-of-band with respect to the request/response cycle and may arrive
    /// at any time while operating.
    ValueChanged {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    Flush(u32),
}

/// The platform's native BLE stack, as seen by a [`Session`]
///
/// All the request methods only *initiate* work; the corresponding result is
/// delivered later as a [`TransportEvent`] through the sender given to the
/// transport constructor. The transport must never be asked to carry more
/// than one outstanding subscribe/read request per connection and the
/// session guarantees that it never will be.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_connection(&self, peripheral: &Peripheral) -> Result<()>;

    async fn discover_topology(&self) -> Result<()>;

    /// Asks for notifications to be enabled by writing to the
    /// characteristic's client configuration descriptor.
    async fn subscribe(&self, characteristic: CharacteristicHandle, cccd: DescriptorHandle)
                       -> Result<()>;

    async fn read(&self, characteristic: CharacteristicHandle) -> Result<()>;

    /// Releases the underlying connection resource. Must be idempotent.
    ///
    /// Note: this is synchronous so it can also be driven from drop(); the
    /// actual teardown doesn't need to happen synchronously.
    fn close_connection(&self);

    /// Echoes `Flush(id)` through the event stream after any events the
    /// transport has already raised. Used to synchronize tests with the
    /// session's event processing.
    fn flush(&self, id: u32) -> Result<()>;
}

/// Why a session ended without the application asking it to
#[derive(Clone, Debug, PartialEq)]
pub enum DisconnectReason {
    /// The link could not be established in the first place.
    ConnectFailed(Option<GattError>),
    /// The services/characteristics could not be enumerated.
    DiscoveryFailed(Option<GattError>),
    /// The link dropped mid-session.
    LinkDropped(Option<GattError>),
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    #[non_exhaustive]
    StateChanged {
        state: ConnectionState,
    },

    /// A queued read completed with the given value.
    #[non_exhaustive]
    CharacteristicRead {
        uuid: Uuid,
        value: Vec<u8>,
    },

    /// An unsolicited notification arrived for a subscribed characteristic.
    #[non_exhaustive]
    CharacteristicChanged {
        uuid: Uuid,
        value: Vec<u8>,
    },

    /// One queued subscribe or read failed.
    ///
    /// This is not terminal for the session; the remaining operations are
    /// still dispatched, since one characteristic's failure shouldn't
    /// prevent reading or subscribing to the others.
    #[non_exhaustive]
    OperationFailed {
        uuid: Uuid,
        operation: OperationKind,
        error: GattError,
    },

    /// The session ended without the application asking it to. Reported
    /// exactly once, before the terminal `StateChanged` event.
    #[non_exhaustive]
    ConnectionLost {
        reason: DisconnectReason,
    },

    Flush(u32),
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connection = match self.state.try_lock() {
            Ok(state) => format!("{:?}", state.connection),
            Err(_) => "<locked>".to_string(),
        };
        f.debug_struct("Session")
            .field("peripheral", &self.peripheral.to_string())
            .field("state", &connection)
            .finish()
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for SessionInner
// we don't really leak anything
pub struct SessionInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<SessionEvent>,
    next_flush_index: AtomicU32,

    transport: Box<dyn Transport>,
    peripheral: Peripheral,

    // There is also a 'transport bus' that serves as the single stream of
    // completion events from the transport, consumed by a task spawned
    // during `connect()`. One end is handed to the transport constructor
    // and the other is passed into that task, so we don't store it here.

    // All mutation funnels through this lock, either from the transport
    // event task or from an application `disconnect()` request, so no two
    // events for the session are ever processed concurrently.
    state: Mutex<SessionState>,
}

struct SessionState {
    connection: ConnectionState,
    topology: Topology,
    queue: OperationQueue,

    // Guards the close_connection call so the transport's connection
    // resource is released exactly once per session
    released: bool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // No other reference can hold the lock once we're dropping
        if let Ok(mut state) = self.state.try_lock() {
            if !state.released {
                state.released = true;
                self.transport.close_connection();
            }
        }
    }
}

fn as_gatt_error(error: Error) -> GattError {
    match error {
        Error::PeripheralGattProtocolError(gatt_error) => gatt_error,
        other => GattError::GeneralFailure(other.to_string()),
    }
}

impl Session {
    // In situations where we need to pass around a reference to a Session
    // internally but need to avoid creating a circular reference (such as for
    // the task spawned to process transport events) we share a Weak<>
    // reference to the SessionInner and then on-demand (when processing a
    // transport event) we `upgrade` the reference to an `Arc` and use this
    // api to re`wrap()` the SessionInner into a bona fide `Session`.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Starts a new connection attempt against `peripheral`.
    ///
    /// The `transport` constructor is handed the sender for the transport's
    /// completion events; everything the platform stack reports back must
    /// flow through it.
    ///
    /// A successful result means the request to connect has been _initiated_.
    /// Subscribe to [`events`][Self::events] for the subsequent
    /// [`SessionEvent::StateChanged`] / [`SessionEvent::ConnectionLost`]
    /// events to observe the outcome.
    pub async fn connect<T, F>(peripheral: Peripheral, transport: F) -> Result<Session>
        where T: Transport + 'static,
              F: FnOnce(mpsc::UnboundedSender<TransportEvent>) -> T
    {
        let (event_bus, _) = broadcast::channel(16);

        // The transport feeds the transport bus and the task spawned below
        // handles all the state tracking, forwarding session events to the
        // application as necessary
        let (transport_bus_tx, transport_bus_rx) = mpsc::unbounded_channel();
        let transport = Box::new(transport(transport_bus_tx));

        let session =
            Session { inner: Arc::new(SessionInner {
                          event_bus,
                          next_flush_index: AtomicU32::new(0),
                          transport,
                          peripheral,
                          state: Mutex::new(SessionState { connection: ConnectionState::Idle,
                                                           topology: Topology::default(),
                                                           queue: OperationQueue::new(),
                                                           released: false }),
                      }) };

        // XXX: the task is only given a Weak reference to the session,
        // otherwise it would introduce a circular reference and it wouldn't
        // be possible to drop a Session. The task upgrades this to a strong
        // reference only while actually processing a transport event, and
        // will also recognise when the TX end of the transport bus closes.
        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move {
            Session::run_transport_task(weak_session, transport_bus_rx).await
        });

        {
            let mut state = session.state.lock().await;
            state.connection = ConnectionState::Connecting;
            session.notify_state(&state);

            trace!("Opening connection to {}", session.peripheral);
            if let Err(err) = session.transport.open_connection(&session.peripheral).await {
                let error = as_gatt_error(err);
                let reason = DisconnectReason::ConnectFailed(Some(error.clone()));
                session.enter_disconnected(&mut state, Some(reason));
                return Err(error.into());
            }
        }

        Ok(session)
    }

    /// The peripheral this session was created for.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.connection
    }

    /// A snapshot of the discovered topology.
    ///
    /// Empty until discovery completes; stable from then on.
    pub async fn topology(&self) -> Topology {
        self.state.lock().await.topology.clone()
    }

    /// Returns a stream of session events: state changes, read results,
    /// notification deliveries and failure reports.
    ///
    /// Each subscription observes events from the point it was created;
    /// the stream is infinite until the session disconnects.
    pub fn events(&self) -> Result<impl Stream<Item = SessionEvent>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    /// Unconditionally ends the session.
    ///
    /// Any in-flight operation is discarded, the remaining queue is cleared
    /// and the transport's connection resource is released. Disconnecting an
    /// already-disconnected session is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection == ConnectionState::Disconnected {
            trace!("Redundant disconnect request; already disconnected");
            return Ok(());
        }

        trace!("Disconnecting from {} at the application's request", self.peripheral);
        self.enter_disconnected(&mut state, None);
        Ok(())
    }

    /// Round-trips a marker through the transport's event stream, resolving
    /// once every event the transport raised before it has been processed.
    pub async fn flush(&self) -> Result<()> {
        let id = self.next_flush_index.fetch_add(1, Ordering::SeqCst);
        let events = self.events()?;
        tokio::pin!(events);

        self.transport.flush(id)?;
        while let Some(event) = events.next().await {
            if matches!(event, SessionEvent::Flush(flush_id) if flush_id == id) {
                break;
            }
        }
        Ok(())
    }

    fn notify_state(&self, state: &SessionState) {
        trace!("Session for {} now {:?}", self.peripheral, state.connection);
        let _ = self.event_bus
                    .send(SessionEvent::StateChanged { state: state.connection });
    }

    fn characteristic_uuid(state: &SessionState, characteristic: CharacteristicHandle) -> Uuid {
        state.topology
             .characteristic(characteristic)
             .map(|record| record.uuid)
             .unwrap_or_else(Uuid::nil)
    }

    /// The one terminal transition. Clears the queue, releases the
    /// connection resource (once) and reports the reason, if any, exactly
    /// once before the terminal state change. A `None` reason means the
    /// application asked for the disconnect.
    fn enter_disconnected(&self, state: &mut SessionState, reason: Option<DisconnectReason>) {
        if state.connection == ConnectionState::Disconnected {
            return;
        }

        if let Some(in_flight) = state.queue.in_flight() {
            trace!("Discarding in-flight {} for {:?}",
                   in_flight.kind(),
                   in_flight.characteristic());
        }
        state.queue.clear();
        state.connection = ConnectionState::Disconnected;

        if !state.released {
            state.released = true;
            self.transport.close_connection();
        }

        if let Some(reason) = reason {
            let _ = self.event_bus.send(SessionEvent::ConnectionLost { reason });
        }
        self.notify_state(state);
    }

    /// Dispatches the head of the queue, if anything is pending and nothing
    /// is in flight. An operation whose *initiation* fails is reported like
    /// any other operation failure and the queue advances to the next entry.
    async fn dispatch_pending(&self, state: &mut SessionState) {
        while let Some(operation) = state.queue.dispatch_next() {
            let characteristic = operation.characteristic();
            let request = match operation {
                Operation::SubscribeNotification(handle) => {
                    match state.topology.characteristic(handle).and_then(|record| record.cccd) {
                        Some(cccd) => self.transport.subscribe(handle, cccd).await,
                        // Subscribe entries are only ever planned for
                        // characteristics with a resolved CCCD
                        None => Err(Error::InvalidStateReference),
                    }
                }
                Operation::ReadCharacteristic(handle) => self.transport.read(handle).await,
            };

            match request {
                Ok(()) => {
                    trace!("Dispatched {} for {:?}", operation.kind(), characteristic);
                    // Nothing more may be dispatched until the completion
                    // callback for this operation is observed
                    break;
                }
                Err(err) => {
                    warn!("Failed to dispatch {} for {:?}: {:?}",
                          operation.kind(),
                          characteristic,
                          err);
                    state.queue.complete_in_flight();
                    let _ = self.event_bus.send(SessionEvent::OperationFailed {
                        uuid: Session::characteristic_uuid(state, characteristic),
                        operation: operation.kind(),
                        error: as_gatt_error(err),
                    });
                }
            }
        }
    }

    async fn on_connection_established(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Connecting {
            warn!("Spurious ConnectionEstablished notification in state {:?}",
                  state.connection);
            return Ok(());
        }

        trace!("Connected to {}; requesting topology discovery", self.peripheral);
        state.connection = ConnectionState::Discovering;
        self.notify_state(&state);

        if let Err(err) = self.transport.discover_topology().await {
            warn!("Failed to initiate topology discovery: {:?}", err);
            let reason = DisconnectReason::DiscoveryFailed(Some(as_gatt_error(err)));
            self.enter_disconnected(&mut state, Some(reason));
        }
        Ok(())
    }

    async fn on_connection_failed(&self, error: Option<GattError>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Connecting {
            warn!("Spurious ConnectionFailed notification in state {:?}", state.connection);
            return Ok(());
        }

        self.enter_disconnected(&mut state, Some(DisconnectReason::ConnectFailed(error)));
        Ok(())
    }

    async fn on_connection_lost(&self, error: Option<GattError>) -> Result<()> {
        let mut state = self.state.lock().await;

        // XXX: transports with multiple orthogonal indicators of a
        // disconnect (explicit callback vs observed IO failure) could send
        // redundant notifications, so we normalize this for the application
        if state.connection == ConnectionState::Disconnected {
            warn!("Spurious, unbalanced/redundant ConnectionLost notification from transport");
            return Ok(());
        }

        let reason = match state.connection {
            ConnectionState::Connecting => DisconnectReason::ConnectFailed(error),
            ConnectionState::Discovering => DisconnectReason::DiscoveryFailed(error),
            _ => DisconnectReason::LinkDropped(error),
        };
        self.enter_disconnected(&mut state, Some(reason));
        Ok(())
    }

    async fn on_discovery_complete(&self, services: Vec<ServiceInfo>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Discovering {
            warn!("Spurious DiscoveryComplete notification in state {:?}", state.connection);
            return Ok(());
        }

        let topology = Topology::from_discovery(services);
        let plan = topology.operation_plan();
        trace!("Discovery complete for {}: {} services, {} planned operations",
               self.peripheral,
               topology.services().len(),
               plan.len());

        state.topology = topology;
        state.queue.load(plan);
        state.connection = ConnectionState::Operating;
        self.notify_state(&state);

        self.dispatch_pending(&mut state).await;
        Ok(())
    }

    async fn on_discovery_failed(&self, error: Option<GattError>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Discovering {
            warn!("Spurious DiscoveryFailed notification in state {:?}", state.connection);
            return Ok(());
        }

        self.enter_disconnected(&mut state, Some(DisconnectReason::DiscoveryFailed(error)));
        Ok(())
    }

    async fn on_operation_complete(&self, kind: OperationKind,
                                   characteristic: CharacteristicHandle,
                                   result: std::result::Result<Option<Vec<u8>>, GattError>)
                                   -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection != ConnectionState::Operating {
            trace!("Ignoring {} completion for {:?} in state {:?}",
                   kind,
                   characteristic,
                   state.connection);
            return Ok(());
        }

        match state.queue.in_flight() {
            Some(in_flight) if in_flight.kind() == kind
                               && in_flight.characteristic() == characteristic => {
                state.queue.complete_in_flight();
            }
            other => {
                warn!("Spurious {} completion for {:?} (in flight: {:?})",
                      kind,
                      characteristic,
                      other);
                return Ok(());
            }
        }

        let uuid = Session::characteristic_uuid(&state, characteristic);
        match result {
            Ok(value) => {
                if let Some(value) = value {
                    let _ = self.event_bus
                                .send(SessionEvent::CharacteristicRead { uuid, value });
                } else {
                    trace!("Notifications enabled for {}", uuid);
                }
            }
            Err(error) => {
                let _ = self.event_bus.send(SessionEvent::OperationFailed {
                    uuid,
                    operation: kind,
                    error,
                });
            }
        }

        self.dispatch_pending(&mut state).await;
        Ok(())
    }

    async fn on_value_changed(&self, characteristic: CharacteristicHandle, value: Vec<u8>)
                              -> Result<()> {
        let state = self.state.lock().await;
        if state.connection != ConnectionState::Operating {
            trace!("Ignoring notification for {:?} in state {:?}",
                   characteristic,
                   state.connection);
            return Ok(());
        }

        // Out-of-band with respect to the operation queue: notifications
        // never occupy the single-outstanding-request slot
        let uuid = Session::characteristic_uuid(&state, characteristic);
        let _ = self.event_bus
                    .send(SessionEvent::CharacteristicChanged { uuid, value });
        Ok(())
    }

    async fn run_transport_task(weak_session_inner: Weak<SessionInner>,
                                transport_bus: mpsc::UnboundedReceiver<TransportEvent>) {
        trace!("Starting task to process transport events from the transport bus...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(transport_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            // We only hold a strong reference back to the Session while we're
            // processing a transport event otherwise we would be holding a
            // circular reference...
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting transport event processor task since Session has been dropped");
                    break;
                }
            };

            match event {
                TransportEvent::ConnectionEstablished => {
                    if let Err(err) = session.on_connection_established().await {
                        error!("Error handling connection established event: {:?}", err);
                    }
                }
                TransportEvent::ConnectionFailed { error } => {
                    if let Err(err) = session.on_connection_failed(error).await {
                        error!("Error handling connection failure event: {:?}", err);
                    }
                }
                TransportEvent::ConnectionLost { error } => {
                    if let Err(err) = session.on_connection_lost(error).await {
                        error!("Error handling connection lost event: {:?}", err);
                    }
                }
                TransportEvent::DiscoveryComplete { services } => {
                    if let Err(err) = session.on_discovery_complete(services).await {
                        error!("Error handling discovery completion: {:?}", err);
                    }
                }
                TransportEvent::DiscoveryFailed { error } => {
                    if let Err(err) = session.on_discovery_failed(error).await {
                        error!("Error handling discovery failure: {:?}", err);
                    }
                }
                TransportEvent::SubscribeComplete { characteristic, result } => {
                    if let Err(err) = session.on_operation_complete(OperationKind::Subscribe,
                                                                    characteristic,
                                                                    result.map(|_| None))
                                             .await
                    {
                        error!("Error handling subscribe completion: {:?}", err);
                    }
                }
                TransportEvent::ReadComplete { characteristic, result } => {
                    if let Err(err) = session.on_operation_complete(OperationKind::Read,
                                                                    characteristic,
                                                                    result.map(Some))
                                             .await
                    {
                        error!("Error handling read completion: {:?}", err);
                    }
                }
                TransportEvent::ValueChanged { characteristic, value } => {
                    if let Err(err) = session.on_value_changed(characteristic, value).await {
                        error!("Error handling characteristic value change notification: {:?}",
                               err);
                    }
                }
                TransportEvent::Flush(id) => {
                    trace!("transport flush {} received", id);
                    let _ = session.event_bus.send(SessionEvent::Flush(id));
                }
            }
        }

        trace!("Finished task processing transport events from the transport bus");
    }
}
