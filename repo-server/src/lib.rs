//! A small versioned file repository served over [`comm_core`].
//!
//! - [`Repository`] keeps the catalog of checked-in files
//! - [`RepositoryServer`] registers a handler per command on a
//!   [`Dispatcher`](comm_core::Dispatcher) and serves the repository
//! - [`cli`] holds the argument parsing and logging setup of the binaries

pub mod cli;

pub mod repository;
pub use repository::{CheckIn, Record, Repository, RepositoryError, Status};

pub mod server;
pub use server::RepositoryServer;
