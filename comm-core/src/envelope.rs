//! The [`Envelope`], a self-describing key-value message.
//!
//! Every envelope exchanged between peers is an insertion-ordered list of
//! string attributes. Three of them are always expected: [`attr::COMMAND`],
//! which alone decides how a [`Dispatcher`](crate::Dispatcher) routes the
//! envelope, and the [`attr::FROM`] / [`attr::TO`] endpoints. Everything else
//! is body data owned by the application.

use crate::endpoint::{Endpoint, EndpointError};
use std::fmt::{self, Display, Formatter};
use thiserror::Error as ThisError;

/// Attribute names with a meaning to the communication layer itself.
pub mod attr {
    pub const COMMAND: &str = "command";
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    /// Presence asks the receiving dispatcher to log the full exchange.
    pub const VERBOSE: &str = "verbose";
    /// Names a file whose bytes follow the envelope on the wire.
    pub const FILE: &str = "file";
    /// Byte count of the file that follows the envelope.
    pub const CONTENT_LENGTH: &str = "content-length";
    /// Set on replies whose request failed.
    pub const ERROR: &str = "error";
}

/// Command that asks a dispatcher's processing loop to exit.
pub const SERVER_QUIT: &str = "serverQuit";

/// An ordered mapping from attribute name to attribute value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope(Vec<(String, String)>);

impl Envelope {
    /// Creates an envelope with no attributes.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates an envelope addressed from `from` to `to` carrying `command`.
    pub fn request(command: impl Into<String>, from: &Endpoint, to: &Endpoint) -> Self {
        Self::new()
            .with(attr::TO, to.to_string())
            .with(attr::FROM, from.to_string())
            .with(attr::COMMAND, command)
    }

    /// A builder function that adds the given attribute to the envelope.
    ///
    /// See [`insert`](Self::insert) for more details.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets an attribute. A key that is already present keeps its position
    /// and has its value replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    /// Iterates over the attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The command, or an empty string if none was set.
    pub fn command(&self) -> &str {
        self.get(attr::COMMAND).unwrap_or_default()
    }

    pub fn set_command(&mut self, command: impl Into<String>) {
        self.insert(attr::COMMAND, command);
    }

    pub fn from(&self) -> Result<Endpoint, EnvelopeError> {
        self.endpoint(attr::FROM)
    }

    pub fn set_from(&mut self, from: &Endpoint) {
        self.insert(attr::FROM, from.to_string());
    }

    pub fn to(&self) -> Result<Endpoint, EnvelopeError> {
        self.endpoint(attr::TO)
    }

    pub fn set_to(&mut self, to: &Endpoint) {
        self.insert(attr::TO, to.to_string());
    }

    fn endpoint(&self, key: &'static str) -> Result<Endpoint, EnvelopeError> {
        self.get(key)
            .ok_or(EnvelopeError::MissingAttribute(key))?
            .parse()
            .map_err(|source| EnvelopeError::InvalidEndpoint { key, source })
    }

    /// Builds the skeleton of a reply: same command, `from` and `to` swapped.
    pub fn reply(&self) -> Envelope {
        let mut reply = Envelope::new();
        if let Some(from) = self.get(attr::FROM) {
            reply.insert(attr::TO, from);
        }
        if let Some(to) = self.get(attr::TO) {
            reply.insert(attr::FROM, to);
        }
        reply.insert(attr::COMMAND, self.command());
        reply
    }

    /// The name of the file that accompanies this envelope, if any.
    pub fn file(&self) -> Option<&str> {
        self.get(attr::FILE).filter(|name| !name.is_empty())
    }

    /// The declared length of the accompanying file.
    ///
    /// `None` when the attribute is absent, `Some(Err(_))` when it is present
    /// but not a byte count.
    pub fn content_length(&self) -> Option<Result<u64, std::num::ParseIntError>> {
        self.get(attr::CONTENT_LENGTH).map(|len| len.trim().parse())
    }

    pub fn is_verbose(&self) -> bool {
        self.contains_key(attr::VERBOSE)
    }

    pub fn is_error(&self) -> bool {
        self.contains_key(attr::ERROR)
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "  {key}: {value}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Envelope {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut envelope = Envelope::new();
        for (key, value) in iter {
            envelope.insert(key, value);
        }
        envelope
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope has no `{0}` attribute")]
    MissingAttribute(&'static str),
    #[error("Attribute `{key}` is not an endpoint: {source}")]
    InvalidEndpoint {
        key: &'static str,
        #[source]
        source: EndpointError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_order_and_replaces() {
        let mut env = Envelope::new().with("a", "1").with("b", "2");
        env.insert("a", "3");
        env.insert("c", "4");
        let pairs: Vec<_> = env.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2"), ("c", "4")]);
    }

    #[test]
    fn reply_swaps_endpoints() {
        let client = Endpoint::new("localhost", 8082);
        let server = Endpoint::new("localhost", 8080);
        let req = Envelope::request("browseDescription", &client, &server).with("fileName", "a");
        let reply = req.reply();
        assert_eq!(reply.from().unwrap(), server);
        assert_eq!(reply.to().unwrap(), client);
        assert_eq!(reply.command(), "browseDescription");
        assert!(!reply.contains_key("fileName"));
    }

    #[test]
    fn file_attributes() {
        let env = Envelope::new()
            .with(attr::FILE, "a.txt")
            .with(attr::CONTENT_LENGTH, "12");
        assert_eq!(env.file(), Some("a.txt"));
        assert_eq!(env.content_length(), Some(Ok(12)));

        let bad = Envelope::new().with(attr::CONTENT_LENGTH, "twelve");
        assert!(matches!(bad.content_length(), Some(Err(_))));
        assert_eq!(Envelope::new().with(attr::FILE, "").file(), None);
    }

    #[test]
    fn missing_command_is_empty() {
        assert_eq!(Envelope::new().command(), "");
        assert_eq!(
            Envelope::new().to(),
            Err(EnvelopeError::MissingAttribute(attr::TO))
        );
    }

    #[test]
    fn malformed_endpoint_names_its_attribute() {
        let env = Envelope::new().with(attr::FROM, "nowhere");
        assert_eq!(
            env.from(),
            Err(EnvelopeError::InvalidEndpoint {
                key: attr::FROM,
                source: EndpointError::MissingPort("nowhere".into()),
            })
        );
    }
}
