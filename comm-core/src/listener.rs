use crate::{connection::Connection, endpoint::Endpoint};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error as ThisError;
use tokio::{
    net::{lookup_host, TcpListener, TcpSocket},
    select,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Pause after a failed `accept` so a persistent error such as running out
/// of file descriptors does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Where a [`Listener`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Bound,
    Listening,
    Accepting,
    Stopped,
}

/// Accepts connections on a local endpoint and hands each one to its own
/// handler task.
///
/// Handler tasks are owned by the accept task and each receives a child of
/// the listener's cancellation token. [`stop`](Listener::stop) cancels the
/// token, which interrupts a pending `accept` right away, then waits for every
/// handler to return.
pub struct Listener {
    endpoint: Endpoint,
    backlog: u32,
    state: Arc<Mutex<ListenerState>>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl Listener {
    pub fn new(endpoint: Endpoint, backlog: u32, parent: &Span) -> Self {
        let span = tracing::info_span!(parent: parent, "listener", %endpoint);
        Self {
            endpoint,
            backlog,
            state: Arc::new(Mutex::new(ListenerState::Created)),
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            span,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// The address actually bound, once the listener has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds, listens, and starts the accept task.
    ///
    /// `handler` is called once per accepted connection on a task of its own.
    /// It should return when the token it is given is cancelled.
    pub async fn start<F, Fut>(&self, handler: F) -> Result<SocketAddr, ListenerError>
    where
        F: Fn(Connection, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.state() != ListenerState::Created {
            return Err(ListenerError::AlreadyStarted);
        }

        let host = self
            .endpoint
            .address
            .trim_start_matches('[')
            .trim_end_matches(']');
        let addr = lookup_host((host, self.endpoint.port))
            .await?
            .next()
            .ok_or_else(|| ListenerError::Resolve(self.endpoint.clone()))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        self.set_state(ListenerState::Bound);

        let listener = socket.listen(self.backlog)?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        self.set_state(ListenerState::Listening);
        tracing::info!(parent: &self.span, %local_addr, "Listening");

        let task = tokio::spawn(
            accept_loop(
                listener,
                Arc::new(handler),
                self.cancel.clone(),
                self.state.clone(),
            )
            .instrument(self.span.clone()),
        );
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(local_addr)
    }

    /// Stops accepting, cancels every connection handler and waits for them.
    /// Calling this more than once, or before `start`, is harmless.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(parent: &self.span, "Accept task failed: {}", e);
            }
        }
        self.set_state(ListenerState::Stopped);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    handler: Arc<F>,
    cancel: CancellationToken,
    state: Arc<Mutex<ListenerState>>,
) where
    F: Fn(Connection, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    *state.lock().unwrap_or_else(PoisonError::into_inner) = ListenerState::Accepting;
    tracing::debug!("Waiting for connections");

    let mut connections = JoinSet::new();
    loop {
        select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Accepted connection");
                    let connection = Connection::from_stream(stream);
                    let handler = handler.clone();
                    let token = cancel.child_token();
                    let span = tracing::debug_span!("connection", %peer);
                    connections.spawn(async move { handler(connection, token).await }.instrument(span));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Connection handler failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Connection handler failed: {}", e);
        }
    }
    *state.lock().unwrap_or_else(PoisonError::into_inner) = ListenerState::Stopped;
    tracing::debug!("Listen task stopping");
}

#[derive(Debug, ThisError)]
pub enum ListenerError {
    #[error("Listener was already started")]
    AlreadyStarted,
    #[error("Could not resolve {0}")]
    Resolve(Endpoint),
    #[error("{0}")]
    Io(#[from] io::Error),
}
