//! Asynchronous request/reply messaging over plain TCP streams.
//!
//! Two processes talk by exchanging [`Envelope`]s: ordered lists of string
//! attributes that always name a `command` and the `from` / `to`
//! [`Endpoint`]s. An envelope may be followed on the wire by the raw bytes of
//! a file, which is how files move between peers.
//!
//! # Organization
//! - [`Connection`] and [`Listener`] wrap the TCP streams and the accept loop
//! - [`Sender`] and [`Receiver`] move envelopes between a [`BlockingQueue`]
//!   and the network, each from its own task
//! - [`Comm`] puts a sender and a receiver behind one handle
//! - [`Dispatcher`] serves requests arriving at a [`Comm`] by command name
//!
//! # Logging
//!
//! The library logs through [`tracing`] and never installs a subscriber.
//! Every line is recorded inside the span of the [`Comm`] it belongs to, so
//! the application decides where logs go and how much of them it keeps.

pub mod config;
pub use config::CommConfig;

pub mod endpoint;
pub use endpoint::{Endpoint, EndpointError};

pub mod envelope;
pub use envelope::{Envelope, EnvelopeError, SERVER_QUIT};

pub mod wire;
pub use wire::WireError;

mod queue;
pub use queue::BlockingQueue;

pub mod connection;
pub use connection::{Connection, ConnectionError};

pub mod listener;
pub use listener::{Listener, ListenerError, ListenerState};

mod sender;
pub use sender::Sender;

mod receiver;
pub use receiver::Receiver;

mod comm;
pub use comm::Comm;

pub mod dispatcher;
pub use dispatcher::{DispatchError, Dispatcher, Handler};
