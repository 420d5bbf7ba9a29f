//! Endpoint abstraction -- the delivery targets the bus routes to.
//!
//! Same blanket-impl layout as the other dynamic-dispatch wrappers:
//! 1. `Endpoint` uses native async fn in traits (RPITIT)
//! 2. `EndpointDyn` is the object-safe mirror with boxed futures
//! 3. `BoxEndpoint` wraps `Box<dyn EndpointDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use relaybus_types::envelope::Envelope;
use relaybus_types::error::EndpointError;
use tokio::sync::mpsc;

/// A destination that can accept envelopes.
///
/// Implementations are driven by a dedicated delivery worker, one call at a
/// time, so `deliver` may await without blocking the bus.
pub trait Endpoint: Send + Sync {
    /// Hand one envelope to the endpoint.
    fn deliver(
        &self,
        envelope: Envelope,
    ) -> impl Future<Output = Result<(), EndpointError>> + Send;

    /// Cheap liveness check used by the health monitor.
    ///
    /// The default reports the endpoint as reachable.
    fn probe(&self) -> impl Future<Output = Result<(), EndpointError>> + Send {
        async { Ok(()) }
    }
}

/// Object-safe version of [`Endpoint`] with boxed futures.
pub trait EndpointDyn: Send + Sync {
    fn deliver_boxed(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EndpointError>> + Send + '_>>;

    fn probe_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), EndpointError>> + Send + '_>>;
}

impl<T: Endpoint> EndpointDyn for T {
    fn deliver_boxed(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EndpointError>> + Send + '_>> {
        Box::pin(self.deliver(envelope))
    }

    fn probe_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), EndpointError>> + Send + '_>> {
        Box::pin(self.probe())
    }
}

/// Type-erased endpoint so the registry can hold heterogeneous targets.
pub struct BoxEndpoint {
    inner: Box<dyn EndpointDyn + Send + Sync>,
}

impl BoxEndpoint {
    pub fn new<T: Endpoint + 'static>(endpoint: T) -> Self {
        Self {
            inner: Box::new(endpoint),
        }
    }

    pub async fn deliver(&self, envelope: Envelope) -> Result<(), EndpointError> {
        self.inner.deliver_boxed(envelope).await
    }

    pub async fn probe(&self) -> Result<(), EndpointError> {
        self.inner.probe_boxed().await
    }
}

impl std::fmt::Debug for BoxEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxEndpoint").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// In-memory endpoint
// ---------------------------------------------------------------------------

/// Endpoint backed by a bounded in-process channel.
///
/// `deliver` waits for queue space, so a consumer that stops reading makes
/// deliveries hit the bus delivery timeout. Dropping the receiver closes the
/// endpoint and fails both deliveries and probes.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    sender: mpsc::Sender<Envelope>,
}

impl ChannelEndpoint {
    /// Create an endpoint and the receiver its envelopes arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl Endpoint for ChannelEndpoint {
    async fn deliver(&self, envelope: Envelope) -> Result<(), EndpointError> {
        self.sender
            .send(envelope)
            .await
            .map_err(|_| EndpointError::Closed)
    }

    async fn probe(&self) -> Result<(), EndpointError> {
        if self.sender.is_closed() {
            Err(EndpointError::Closed)
        } else {
            Ok(())
        }
    }
}
