//! Routing of inbound envelopes to command handlers.
//!
//! A [`Dispatcher`] owns a [`Comm`] and a table from command name to
//! [`Handler`]. Its processing task takes each inbound envelope, runs the
//! handler registered for the envelope's command and posts the handler's
//! reply back to whoever sent the request. The task ends when it reads a
//! [`SERVER_QUIT`] envelope.

use crate::{
    comm::Comm,
    envelope::{attr, Envelope, SERVER_QUIT},
    listener::ListenerError,
};
use rustc_hash::FxHashMap;
use std::{
    any::Any,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error as ThisError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Turns a request into its reply.
///
/// Handlers are synchronous and may block, for example on file-system work;
/// they are run on the blocking thread pool. The dispatcher overwrites the
/// reply's `from` and `to` with the request's `to` and `from`, and fills in
/// the request's command when the reply has none.
pub type Handler = Arc<dyn Fn(Envelope) -> Envelope + Send + Sync>;

pub struct Dispatcher {
    comm: Arc<Comm>,
    handlers: FxHashMap<String, Handler>,
    task: Mutex<Option<JoinHandle<()>>>,
    finished: CancellationToken,
}

impl Dispatcher {
    pub fn new(comm: Comm) -> Self {
        Self {
            comm: Arc::new(comm),
            handlers: Default::default(),
            task: Mutex::new(None),
            finished: CancellationToken::new(),
        }
    }

    pub fn comm(&self) -> &Arc<Comm> {
        &self.comm
    }

    /// Registers `handler` for `command`, replacing any earlier handler for
    /// the same command. Handlers added after [`run`](Dispatcher::run) are
    /// not seen by the running task.
    pub fn add_handler<F>(&mut self, command: impl Into<String>, handler: F)
    where
        F: Fn(Envelope) -> Envelope + Send + Sync + 'static,
    {
        self.handlers.insert(command.into(), Arc::new(handler));
    }

    pub fn handles(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Starts the underlying comm.
    pub async fn start(&self) -> Result<(), ListenerError> {
        self.comm.start().await
    }

    /// Spawns the processing task. Does nothing if it is already running.
    pub fn run(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        if self.handlers.is_empty() {
            tracing::warn!(parent: self.comm.span(), "Running a dispatcher with no handlers");
        }
        let span = tracing::info_span!(parent: self.comm.span(), "dispatcher");
        *task = Some(tokio::spawn(
            process_loop(
                self.comm.clone(),
                Arc::new(self.handlers.clone()),
                self.finished.clone(),
            )
            .instrument(span),
        ));
    }

    /// Completes once the processing task has exited, whether because of
    /// [`stop`](Dispatcher::stop) or a [`SERVER_QUIT`] sent by a peer. Never
    /// completes if [`run`](Dispatcher::run) was not called.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Posts an envelope through the underlying comm.
    pub fn post_message(&self, envelope: Envelope) {
        self.comm.post_message(envelope);
    }

    /// Runs the handler for `request` and returns its reply without sending
    /// anything.
    pub async fn dispatch(&self, request: Envelope) -> Result<Envelope, DispatchError> {
        dispatch(&self.handlers, request).await
    }

    /// Asks the processing task to exit, waits for it, then stops the comm.
    ///
    /// The quit request is queued locally behind every envelope that has
    /// already arrived, so those are still served first.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            self.comm
                .inbound()
                .enqueue(Envelope::new().with(attr::COMMAND, SERVER_QUIT));
            if let Err(e) = task.await {
                tracing::error!(parent: self.comm.span(), "Dispatcher task failed: {}", e);
            }
        }
        self.comm.stop().await;
    }
}

async fn process_loop(
    comm: Arc<Comm>,
    handlers: Arc<FxHashMap<String, Handler>>,
    finished: CancellationToken,
) {
    let _finished = finished.drop_guard();
    tracing::debug!("Dispatcher running");
    loop {
        let request = comm.get_message().await;
        let command = request.command().to_string();
        tracing::debug!(%command, from = request.get(attr::FROM), "Received request");
        if command == SERVER_QUIT {
            break;
        }

        let verbose = request.is_verbose();
        if verbose {
            tracing::info!("Request: {:?}", request);
        }

        let Some(reply) = build_reply(&handlers, request).await else {
            continue;
        };
        if verbose {
            tracing::info!("Reply: {:?}", reply);
        }

        match reply.to() {
            Ok(to) if to == comm.local_endpoint() => {
                tracing::warn!(%command, %to, "Not posting a reply addressed to this dispatcher");
            }
            Ok(_) => comm.post_message(reply),
            Err(e) => tracing::warn!(%command, "Request has no usable sender: {}", e),
        }
    }
    tracing::debug!("Dispatcher stopping");
}

/// Runs the handler and addresses its reply. `None` means there is nothing to
/// send; the reason has been logged.
async fn build_reply(
    handlers: &FxHashMap<String, Handler>,
    request: Envelope,
) -> Option<Envelope> {
    let from = request.get(attr::FROM).map(str::to_string);
    let to = request.get(attr::TO).map(str::to_string);
    let command = request.command().to_string();

    let mut reply = match dispatch(handlers, request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(%command, "{}", e);
            return None;
        }
    };
    if reply.command().is_empty() {
        reply.set_command(command);
    }
    match from {
        Some(from) => reply.insert(attr::TO, from),
        None => {
            reply.remove(attr::TO);
        }
    }
    match to {
        Some(to) => reply.insert(attr::FROM, to),
        None => {
            reply.remove(attr::FROM);
        }
    }
    Some(reply)
}

async fn dispatch(
    handlers: &FxHashMap<String, Handler>,
    request: Envelope,
) -> Result<Envelope, DispatchError> {
    let command = request.command().to_string();
    let handler = handlers
        .get(&command)
        .cloned()
        .ok_or_else(|| DispatchError::UnknownCommand(command.clone()))?;
    tokio::task::spawn_blocking(move || handler(request))
        .await
        .map_err(|e| {
            let reason = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            DispatchError::HandlerFailed { command, reason }
        })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "handler panicked".to_string()),
    }
}

#[derive(Debug, ThisError)]
pub enum DispatchError {
    #[error("No handler registered for command `{0}`")]
    UnknownCommand(String),
    #[error("Handler for `{command}` failed: {reason}")]
    HandlerFailed { command: String, reason: String },
}
