//! The versioned file catalog behind the server's commands.
//!
//! Files are checked in under a package name. Each check-in lands in the
//! storage directory as `name.version`, with a [`Record`] describing it. A
//! version stays open, and is replaced in place by later check-ins, until it
//! is closed; the check-in after that starts the next version.

use chrono::{DateTime, Local};
use dashmap::DashMap;
use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
    fs, io,
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::{Mutex, PoisonError},
};
use thiserror::Error as ThisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Closed,
    /// Closing was asked for but a dependency is still open or depends back
    /// on this package.
    PendingClose,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Open => "Open",
            Status::Closed => "Closed",
            Status::PendingClose => "PendingClose",
        };
        f.write_str(text)
    }
}

impl FromStr for Status {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(Status::Open),
            "Closed" => Ok(Status::Closed),
            "PendingClose" => Ok(Status::PendingClose),
            _ => Err(RepositoryError::InvalidAttribute("status", s.to_string())),
        }
    }
}

/// Metadata for one checked-in version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub author: String,
    pub categories: Vec<String>,
    /// Names of the packages this one depends on.
    pub dependencies: Vec<String>,
    pub status: Status,
    pub date_time: DateTime<Local>,
}

impl Record {
    /// The catalog key and stored file name, `name.version`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.name, self.version)
    }
}

/// What a client supplies to check a staged file in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckIn {
    pub name: String,
    pub description: String,
    pub author: String,
    pub categories: Vec<String>,
    pub dependencies: Vec<String>,
    pub close: bool,
}

pub struct Repository {
    storage: PathBuf,
    staging: PathBuf,
    records: DashMap<String, Record>,
    latest: DashMap<String, u32>,
    check_in_lock: Mutex<()>,
}

impl Repository {
    /// Creates an empty catalog storing files under `storage` and taking
    /// uploads from `staging`. Both directories are created if needed.
    pub fn new(storage: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let storage = storage.into();
        let staging = staging.into();
        fs::create_dir_all(&storage)?;
        fs::create_dir_all(&staging)?;
        Ok(Self {
            storage,
            staging,
            records: Default::default(),
            latest: Default::default(),
            check_in_lock: Mutex::new(()),
        })
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Whether a file with this name is waiting in the staging directory.
    pub fn is_staged(&self, file: &str) -> bool {
        staged_name(file)
            .map(|name| self.staging.join(name).is_file())
            .unwrap_or(false)
    }

    /// Moves the staged file `request.name` into storage and records it.
    pub fn check_in(&self, request: CheckIn) -> Result<Record, RepositoryError> {
        let name = staged_name(&request.name)
            .ok_or_else(|| RepositoryError::InvalidAttribute("name", request.name.clone()))?
            .to_string();
        let staged = self.staging.join(&name);
        if !staged.is_file() {
            return Err(RepositoryError::NotStaged(name));
        }

        let _guard = self.check_in_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let version = match self.latest_record(&name) {
            Some(latest) if latest.status != Status::Closed => latest.version,
            Some(latest) => latest.version + 1,
            None => 1,
        };
        let status = if !request.close {
            Status::Open
        } else if self.can_close(&name, &request.dependencies) {
            Status::Closed
        } else {
            Status::PendingClose
        };

        let record = Record {
            name: name.clone(),
            version,
            description: request.description,
            author: request.author,
            categories: request.categories,
            dependencies: request.dependencies,
            status,
            date_time: Local::now(),
        };
        move_file(&staged, &self.storage.join(record.key()))?;
        self.records.insert(record.key(), record.clone());
        self.latest.insert(name, version);
        tracing::info!(key = %record.key(), status = %record.status, "Checked in");
        Ok(record)
    }

    /// Every dependency must have a closed newest version that does not list
    /// `name` among its own dependencies.
    fn can_close(&self, name: &str, dependencies: &[String]) -> bool {
        dependencies.iter().all(|dependency| {
            dependency != name
                && matches!(
                    self.latest_record(dependency),
                    Some(record) if record.status == Status::Closed
                        && !record.dependencies.iter().any(|d| d == name)
                )
        })
    }

    fn latest_record(&self, name: &str) -> Option<Record> {
        let version = *self.latest.get(name)?;
        self.records
            .get(&format!("{name}.{version}"))
            .map(|record| record.clone())
    }

    /// Looks up `name.version`, or the newest version of `name`.
    pub fn get(&self, key: &str) -> Result<Record, RepositoryError> {
        if let Some(record) = self.records.get(key) {
            return Ok(record.clone());
        }
        self.latest_record(key)
            .ok_or_else(|| RepositoryError::UnknownKey(key.to_string()))
    }

    /// Stored file names for `key` and, if asked, the newest version of every
    /// package it depends on directly or indirectly. `key`'s own file is
    /// always first.
    pub fn check_out(&self, key: &str, with_dependencies: bool) -> Result<Vec<String>, RepositoryError> {
        let root = self.get(key)?;
        let mut files = vec![root.key()];
        if !with_dependencies {
            return Ok(files);
        }

        let mut seen: HashSet<String> = HashSet::from([root.name.clone()]);
        let mut pending = root.dependencies.clone();
        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            match self.latest_record(&name) {
                Some(record) => {
                    files.push(record.key());
                    pending.extend(record.dependencies);
                }
                None => tracing::warn!(key, dependency = %name, "Dependency was never checked in"),
            }
        }
        Ok(files)
    }

    /// One `key: description` line per record whose key starts with
    /// `prefix`, sorted by key.
    pub fn browse(&self, prefix: &str) -> Vec<String> {
        let mut lines: Vec<_> = self
            .records
            .iter()
            .filter(|record| record.key().starts_with(prefix))
            .map(|record| (record.value().key(), record.description.clone()))
            .collect();
        lines.sort();
        lines
            .into_iter()
            .map(|(key, description)| format!("{key}: {description}"))
            .collect()
    }

    /// Every field of the record for `key`, one per line.
    pub fn metadata(&self, key: &str) -> Result<Vec<String>, RepositoryError> {
        let record = self.get(key)?;
        Ok(vec![
            format!("name: {}", record.key()),
            format!("dateTime: {}", record.date_time.format("%Y-%m-%d %H:%M:%S")),
            format!("description: {}", record.description),
            format!("author: {}", record.author),
            format!("children: {}", record.dependencies.join(", ")),
            format!("status: {}", record.status),
            format!("categories: {}", record.categories.join(", ")),
            format!("path: {}", self.storage.join(record.key()).display()),
        ])
    }

    /// Sub-directories of `path`, relative to the storage root.
    pub fn dirs(&self, path: &str) -> Result<Vec<String>, RepositoryError> {
        self.list(path, |file_type| file_type.is_dir())
    }

    /// Files in `path`, relative to the storage root.
    pub fn files(&self, path: &str) -> Result<Vec<String>, RepositoryError> {
        self.list(path, |file_type| file_type.is_file())
    }

    fn list(&self, path: &str, keep: impl Fn(&fs::FileType) -> bool) -> Result<Vec<String>, RepositoryError> {
        let dir = self.resolve(path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if keep(&entry.file_type()?) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Joins a client-supplied relative path onto the storage root. Absolute
    /// paths and `..` are refused.
    fn resolve(&self, path: &str) -> Result<PathBuf, RepositoryError> {
        let mut resolved = self.storage.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(RepositoryError::PathEscape(path.to_string())),
            }
        }
        Ok(resolved)
    }
}

/// The final component of a client-supplied file name.
fn staged_name(file: &str) -> Option<&str> {
    Path::new(file).file_name().and_then(|name| name.to_str())
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Staging and storage may be on different file systems
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[derive(Debug, ThisError)]
pub enum RepositoryError {
    #[error("No package or version named `{0}`")]
    UnknownKey(String),
    #[error("`{0}` has not been uploaded")]
    NotStaged(String),
    #[error("Request is missing the `{0}` attribute")]
    MissingAttribute(&'static str),
    #[error("Invalid {0} `{1}`")]
    InvalidAttribute(&'static str, String),
    #[error("Path `{0}` is outside the repository")]
    PathEscape(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}
