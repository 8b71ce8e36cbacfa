//! The repository's command handlers, served by a [`Dispatcher`].

use crate::repository::{CheckIn, Repository, RepositoryError};
use comm_core::{envelope::attr, Comm, CommConfig, Dispatcher, Endpoint, Envelope, ListenerError};
use std::sync::Arc;

/// Attribute names used by requests and replies.
pub mod field {
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const AUTHOR: &str = "author";
    /// Comma separated.
    pub const CATEGORIES: &str = "categories";
    /// Comma separated package names.
    pub const DEPENDENCIES: &str = "dependencies";
    /// `true` asks for the checked-in version to be closed.
    pub const CLOSE: &str = "close";
    pub const KEY: &str = "key";
    pub const WITH_DEPENDENCIES: &str = "withDependencies";
    pub const PATH: &str = "path";
    pub const STAGED: &str = "staged";
    pub const STATUS: &str = "status";
}

/// Commands understood by the server.
pub mod command {
    pub const CHECK_IN: &str = "checkIn";
    pub const CHECK_IN_FILES: &str = "checkInFiles";
    pub const CHECK_OUT_FILES: &str = "checkOutFiles";
    pub const BROWSE_DESCRIPTION: &str = "browseDescription";
    pub const METADATA_CONTENT: &str = "metadataContent";
    pub const GET_FILES: &str = "getFiles";
    pub const GET_DIRS: &str = "getDirs";
    pub const ECHO: &str = "echo";
}

type Procedure = fn(&Repository, &Envelope) -> Result<Envelope, RepositoryError>;

/// A [`Repository`] reachable over the network.
///
/// Uploaded files arrive in the repository's staging directory and checked
/// out files are sent from its storage directory.
pub struct RepositoryServer {
    dispatcher: Dispatcher,
    repository: Arc<Repository>,
}

impl RepositoryServer {
    pub fn new(endpoint: Endpoint, repository: Repository) -> Self {
        Self::with_config(endpoint, repository, CommConfig::new())
    }

    /// Like [`new`](RepositoryServer::new). The send and save paths of
    /// `config` are replaced by the repository's storage and staging paths.
    pub fn with_config(endpoint: Endpoint, repository: Repository, config: CommConfig) -> Self {
        let config = config
            .send_path(repository.storage())
            .save_path(repository.staging());
        let repository = Arc::new(repository);
        let mut dispatcher = Dispatcher::new(Comm::with_config(endpoint, "repository", config));

        let procedures: [(&str, Procedure); 8] = [
            (command::CHECK_IN, check_in),
            (command::CHECK_IN_FILES, check_in_files),
            (command::CHECK_OUT_FILES, check_out_files),
            (command::BROWSE_DESCRIPTION, browse_description),
            (command::METADATA_CONTENT, metadata_content),
            (command::GET_FILES, get_files),
            (command::GET_DIRS, get_dirs),
            (command::ECHO, echo),
        ];
        for (command, procedure) in procedures {
            let repository = repository.clone();
            dispatcher.add_handler(command, move |request| {
                procedure(&repository, &request).unwrap_or_else(|e| {
                    tracing::warn!(command = request.command(), "Request failed: {}", e);
                    request.reply().with(attr::ERROR, e.to_string())
                })
            });
        }
        Self {
            dispatcher,
            repository,
        }
    }

    /// Starts listening and serving requests.
    pub async fn start(&self) -> Result<(), ListenerError> {
        self.dispatcher.start().await?;
        self.dispatcher.run();
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.dispatcher.comm().local_endpoint()
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    /// Completes when a client has asked the server to quit.
    pub async fn finished(&self) {
        self.dispatcher.finished().await
    }

    pub async fn stop(&self) {
        self.dispatcher.stop().await
    }
}

fn required<'a>(request: &'a Envelope, key: &'static str) -> Result<&'a str, RepositoryError> {
    request
        .get(key)
        .filter(|value| !value.is_empty())
        .ok_or(RepositoryError::MissingAttribute(key))
}

fn list(request: &Envelope, key: &str) -> Vec<String> {
    request
        .get(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn flag(request: &Envelope, key: &str) -> bool {
    request
        .get(key)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Adds `prefix1`, `prefix2`, ... for each item.
fn numbered(mut reply: Envelope, prefix: &str, items: &[String]) -> Envelope {
    for (i, item) in items.iter().enumerate() {
        reply.insert(format!("{prefix}{}", i + 1), item.as_str());
    }
    reply
}

/// Confirms that an uploaded file has been staged.
fn check_in(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let file = request.file().ok_or(RepositoryError::MissingAttribute(attr::FILE))?;
    if !repository.is_staged(file) {
        return Err(RepositoryError::NotStaged(file.to_string()));
    }
    Ok(request.reply().with(field::STAGED, file))
}

/// Commits a staged file with its metadata.
fn check_in_files(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let record = repository.check_in(CheckIn {
        name: required(request, field::NAME)?.to_string(),
        description: request.get(field::DESCRIPTION).unwrap_or_default().to_string(),
        author: request.get(field::AUTHOR).unwrap_or_default().to_string(),
        categories: list(request, field::CATEGORIES),
        dependencies: list(request, field::DEPENDENCIES),
        close: flag(request, field::CLOSE),
    })?;
    Ok(request
        .reply()
        .with(field::KEY, record.key())
        .with(field::STATUS, record.status.to_string()))
}

/// Lists the files of a check-out and sends the first of them back.
fn check_out_files(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let key = required(request, field::KEY)?;
    let files = repository.check_out(key, flag(request, field::WITH_DEPENDENCIES))?;
    let mut reply = numbered(request.reply(), attr::FILE, &files);
    if let Some(primary) = files.first() {
        reply.insert(attr::FILE, primary.as_str());
    }
    Ok(reply)
}

fn browse_description(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let prefix = request.get(field::KEY).unwrap_or_default();
    let lines = repository.browse(prefix);
    if lines.is_empty() && !prefix.is_empty() {
        return Err(RepositoryError::UnknownKey(prefix.to_string()));
    }
    Ok(numbered(request.reply(), field::DESCRIPTION, &lines))
}

fn metadata_content(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let lines = repository.metadata(required(request, field::KEY)?)?;
    Ok(numbered(request.reply(), "metadata", &lines))
}

fn get_files(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let files = repository.files(request.get(field::PATH).unwrap_or_default())?;
    Ok(numbered(request.reply(), attr::FILE, &files))
}

fn get_dirs(repository: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    let dirs = repository.dirs(request.get(field::PATH).unwrap_or_default())?;
    Ok(numbered(request.reply(), "dir", &dirs))
}

/// Replies with the request's body attributes.
fn echo(_: &Repository, request: &Envelope) -> Result<Envelope, RepositoryError> {
    const RESERVED: [&str; 7] = [
        attr::COMMAND,
        attr::FROM,
        attr::TO,
        attr::VERBOSE,
        attr::FILE,
        attr::CONTENT_LENGTH,
        attr::ERROR,
    ];
    Ok(request
        .iter()
        .filter(|(key, _)| !RESERVED.contains(key))
        .fold(request.reply(), |reply, (key, value)| reply.with(key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repository =
            Repository::new(dir.path().join("storage"), dir.path().join("staging")).unwrap();
        (dir, repository)
    }

    fn request(command: &str) -> Envelope {
        Envelope::request(
            command,
            &Endpoint::new("localhost", 8082),
            &Endpoint::new("localhost", 8080),
        )
    }

    #[test]
    fn check_in_then_out() {
        let (_dir, repository) = repository();
        std::fs::write(repository.staging().join("a.rs"), "fn main() {}").unwrap();

        let staged = check_in(&repository, &request(command::CHECK_IN).with(attr::FILE, "a.rs")).unwrap();
        assert_eq!(staged.get(field::STAGED), Some("a.rs"));
        assert!(staged.file().is_none());

        let committed = check_in_files(
            &repository,
            &request(command::CHECK_IN_FILES)
                .with(field::NAME, "a.rs")
                .with(field::CATEGORIES, "core, , tools")
                .with(field::CLOSE, "TRUE"),
        )
        .unwrap();
        assert_eq!(committed.get(field::KEY), Some("a.rs.1"));
        assert_eq!(committed.get(field::STATUS), Some("Closed"));
        assert_eq!(repository.get("a.rs").unwrap().categories, vec!["core", "tools"]);

        let out = check_out_files(&repository, &request(command::CHECK_OUT_FILES).with(field::KEY, "a.rs")).unwrap();
        assert_eq!(out.file(), Some("a.rs.1"));
        assert_eq!(out.get("file1"), Some("a.rs.1"));
    }

    #[test]
    fn missing_attributes_are_reported() {
        let (_dir, repository) = repository();
        assert!(matches!(
            check_in_files(&repository, &request(command::CHECK_IN_FILES)),
            Err(RepositoryError::MissingAttribute(field::NAME))
        ));
        assert!(matches!(
            check_in(&repository, &request(command::CHECK_IN)),
            Err(RepositoryError::MissingAttribute(attr::FILE))
        ));
        assert!(matches!(
            metadata_content(&repository, &request(command::METADATA_CONTENT)),
            Err(RepositoryError::MissingAttribute(field::KEY))
        ));
    }

    #[test]
    fn echo_drops_reserved_attributes() {
        let (_dir, repository) = repository();
        let reply = echo(
            &repository,
            &request(command::ECHO)
                .with("body", "hello")
                .with(attr::FILE, "x")
                .with(attr::VERBOSE, ""),
        )
        .unwrap();
        assert_eq!(reply.get("body"), Some("hello"));
        assert!(!reply.contains_key(attr::FILE));
        assert!(!reply.contains_key(attr::VERBOSE));
        assert_eq!(reply.to().unwrap(), Endpoint::new("localhost", 8082));
    }

    #[test]
    fn numbered_attributes() {
        let reply = numbered(Envelope::new(), "dir", &["a".to_string(), "b".to_string()]);
        assert_eq!(reply.get("dir1"), Some("a"));
        assert_eq!(reply.get("dir2"), Some("b"));
        assert_eq!(reply.len(), 2);
    }
}
