use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::trace;
use tokio::sync::mpsc;

use crate::peripheral::Peripheral;
use crate::session::{Transport, TransportEvent};
use crate::{Address, CharacteristicHandle, DescriptorHandle, Result};

/// One request dispatched by a session to a [`FakeTransport`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeRequest {
    OpenConnection(Address),
    DiscoverTopology,
    Subscribe(CharacteristicHandle, DescriptorHandle),
    Read(CharacteristicHandle),
}

#[derive(Debug, Default)]
struct Shared {
    bus: StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    requests: StdMutex<Vec<FakeRequest>>,
    close_count: AtomicUsize,
}

/// Remote control for a [`FakeTransport`]
///
/// A `FakeTransport` completes nothing on its own: it records each request
/// it receives and leaves the completion callbacks a real platform stack
/// would deliver to the controller's [`emit`](FakeController::emit). That
/// keeps tests fully in charge of the callback timeline: a session never
/// observes a completion the test hasn't explicitly injected.
#[derive(Clone, Debug, Default)]
pub struct FakeController {
    shared: Arc<Shared>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport constructor to hand to [`Session::connect`]
    ///
    /// [`Session::connect`]: crate::session::Session::connect
    pub fn transport(
        &self)
        -> impl FnOnce(mpsc::UnboundedSender<TransportEvent>) -> FakeTransport + Send + 'static
    {
        let shared = self.shared.clone();
        move |bus| {
            *shared.bus.lock().unwrap() = Some(bus);
            FakeTransport { shared }
        }
    }

    /// Delivers a completion event as if the platform stack had raised it.
    pub fn emit(&self, event: TransportEvent) {
        let guard = self.shared.bus.lock().unwrap();
        let bus = guard.as_ref()
                       .expect("no session has been attached to this fake transport");
        // A send error just means the session (and its event task) is gone
        let _ = bus.send(event);
    }

    /// The requests dispatched so far, in dispatch order.
    pub fn requests(&self) -> Vec<FakeRequest> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Drains and returns the request log.
    pub fn take_requests(&self) -> Vec<FakeRequest> {
        std::mem::take(&mut *self.shared.requests.lock().unwrap())
    }

    /// How many times the connection resource has been released.
    pub fn close_count(&self) -> usize {
        self.shared.close_count.load(Ordering::SeqCst)
    }
}

/// A [`Transport`] that records requests instead of performing IO
#[derive(Debug)]
pub struct FakeTransport {
    shared: Arc<Shared>,
}

impl FakeTransport {
    fn record(&self, request: FakeRequest) {
        trace!("fake transport request: {:?}", request);
        self.shared.requests.lock().unwrap().push(request);
    }

    fn send(&self, event: TransportEvent) {
        if let Some(bus) = self.shared.bus.lock().unwrap().as_ref() {
            let _ = bus.send(event);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_connection(&self, peripheral: &Peripheral) -> Result<()> {
        self.record(FakeRequest::OpenConnection(peripheral.address().clone()));
        Ok(())
    }

    async fn discover_topology(&self) -> Result<()> {
        self.record(FakeRequest::DiscoverTopology);
        Ok(())
    }

    async fn subscribe(&self, characteristic: CharacteristicHandle, cccd: DescriptorHandle)
                       -> Result<()> {
        self.record(FakeRequest::Subscribe(characteristic, cccd));
        Ok(())
    }

    async fn read(&self, characteristic: CharacteristicHandle) -> Result<()> {
        self.record(FakeRequest::Read(characteristic));
        Ok(())
    }

    fn close_connection(&self) {
        self.shared.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&self, id: u32) -> Result<()> {
        self.send(TransportEvent::Flush(id));
        Ok(())
    }
}
