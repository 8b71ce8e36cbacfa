use crate::{
    config::CommConfig,
    endpoint::Endpoint,
    envelope::Envelope,
    listener::ListenerError,
    queue::BlockingQueue,
    receiver::Receiver,
    sender::Sender,
};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::Span;

/// A bidirectional messaging facility: one [`Sender`] and one [`Receiver`]
/// behind a single handle.
///
/// The receiver listens on the endpoint given at construction. The sender
/// has no fixed destination; every posted envelope names its own `to`
/// endpoint, so one `Comm` can talk to many peers in turn.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use comm_core::{Comm, Endpoint, Envelope};
///
/// let comm = Comm::new(Endpoint::new("localhost", 8081), "client");
/// comm.start().await?;
/// let server = Endpoint::new("localhost", 8080);
/// comm.post_message(Envelope::request("echo", &comm.local_endpoint(), &server));
/// let reply = comm.get_message().await;
/// println!("{reply}");
/// comm.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Comm {
    name: String,
    endpoint: RwLock<Endpoint>,
    sender: Sender,
    receiver: Receiver,
    span: Span,
}

impl Comm {
    pub fn new(endpoint: Endpoint, name: impl Into<String>) -> Self {
        Self::with_config(endpoint, name, CommConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, name: impl Into<String>, config: CommConfig) -> Self {
        let name = name.into();
        let span = tracing::info_span!("comm", name = %name);
        Self {
            sender: Sender::new(config.clone(), &span),
            receiver: Receiver::new(endpoint.clone(), config, &span),
            endpoint: RwLock::new(endpoint),
            name,
            span,
        }
    }

    /// Starts listening, then starts the send task.
    ///
    /// When the endpoint was given with port 0, the port chosen by the
    /// operating system replaces it and is what
    /// [`local_endpoint`](Comm::local_endpoint) reports from then on.
    pub async fn start(&self) -> Result<(), ListenerError> {
        let bound = self.receiver.start().await?;
        {
            let mut endpoint = self.endpoint.write().unwrap_or_else(PoisonError::into_inner);
            if endpoint.port == 0 {
                endpoint.port = bound.port();
            }
        }
        self.sender.start();
        tracing::info!(parent: &self.span, endpoint = %self.local_endpoint(), "Comm started");
        Ok(())
    }

    /// Flushes the sender, then stops the receiver.
    pub async fn stop(&self) {
        self.sender.stop().await;
        self.receiver.stop().await;
        tracing::info!(parent: &self.span, "Comm stopped");
    }

    /// Queues `envelope` for delivery to its `to` endpoint.
    pub fn post_message(&self, envelope: Envelope) {
        self.sender.post_message(envelope);
    }

    /// Waits for the next inbound envelope.
    pub async fn get_message(&self) -> Envelope {
        self.receiver.get_message().await
    }

    pub fn try_get_message(&self) -> Option<Envelope> {
        self.receiver.try_get_message()
    }

    /// The receive queue. Anything enqueued here is read by
    /// [`get_message`](Comm::get_message) as though it came off the network.
    pub fn inbound(&self) -> Arc<BlockingQueue<Envelope>> {
        self.receiver.queue()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The endpoint this comm listens on.
    pub fn local_endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The span every log line of this comm is recorded under.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("name", &self.name)
            .field("endpoint", &self.local_endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn port_zero_is_replaced_by_bound_port() {
        let comm = Comm::new(Endpoint::new("127.0.0.1", 0), "test");
        comm.start().await.unwrap();
        let endpoint = comm.local_endpoint();
        assert_eq!(endpoint.address, "127.0.0.1");
        assert_ne!(endpoint.port, 0);
        comm.stop().await;
    }

    #[tokio::test]
    async fn talks_to_itself() {
        let comm = Comm::new(Endpoint::new("127.0.0.1", 0), "loop");
        comm.start().await.unwrap();
        let me = comm.local_endpoint();
        comm.post_message(Envelope::request("ping", &me, &me).with("body", "hello"));

        let got = tokio::time::timeout(Duration::from_secs(5), comm.get_message())
            .await
            .unwrap();
        assert_eq!(got.command(), "ping");
        assert_eq!(got.get("body"), Some("hello"));
        comm.stop().await;
    }

    #[tokio::test]
    async fn inbound_queue_feeds_get_message() {
        let comm = Comm::new(Endpoint::new("127.0.0.1", 0), "local");
        comm.inbound().enqueue(Envelope::new().with("command", "local"));
        assert_eq!(comm.try_get_message().unwrap().command(), "local");
        assert!(comm.try_get_message().is_none());
    }
}
