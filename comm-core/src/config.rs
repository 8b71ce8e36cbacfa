use std::{path::PathBuf, time::Duration};

/// Settings shared by a [`Comm`](crate::Comm)'s sender and receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommConfig {
    /// Block size used to stream file payloads.
    pub chunk_size: usize,
    /// Directory the sender reads outgoing files from.
    pub send_path: PathBuf,
    /// Directory the receiver writes incoming files into.
    pub save_path: PathBuf,
    /// How many times the sender tries to connect before dropping a post.
    pub connect_attempts: u32,
    /// Pause between two connection attempts.
    pub connect_retry_delay: Duration,
    /// Backlog passed to `listen`.
    pub listen_backlog: u32,
}

impl CommConfig {
    pub fn new() -> Self {
        Self {
            chunk_size: 1024,
            send_path: PathBuf::from("./SendFiles"),
            save_path: PathBuf::from("./SaveFiles"),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(100),
            listen_backlog: 1024,
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn send_path(mut self, send_path: impl Into<PathBuf>) -> Self {
        self.send_path = send_path.into();
        self
    }

    pub fn save_path(mut self, save_path: impl Into<PathBuf>) -> Self {
        self.save_path = save_path.into();
        self
    }

    pub fn connect_attempts(mut self, connect_attempts: u32) -> Self {
        self.connect_attempts = connect_attempts.max(1);
        self
    }

    pub fn connect_retry_delay(mut self, connect_retry_delay: Duration) -> Self {
        self.connect_retry_delay = connect_retry_delay;
        self
    }

    pub fn listen_backlog(mut self, listen_backlog: u32) -> Self {
        self.listen_backlog = listen_backlog;
        self
    }
}

impl Default for CommConfig {
    fn default() -> Self {
        Self::new()
    }
}
