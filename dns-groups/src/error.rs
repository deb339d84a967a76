//! Error kinds shared across the record store, group index and the
//! caches built on top of them.

use std::fmt;

/// Failures that can occur while loading, saving or mutating group
/// and record-store state.
#[derive(Debug)]
pub enum Error {
    /// The group's blob or the catalogue could not be read or
    /// written.
    Io(std::io::Error),
    /// The record-store blob could not be encoded or decoded.
    Encode(bincode::Error),
    /// The group catalogue could not be parsed or serialised.
    Yaml(serde_yaml::Error),
    /// A DNS resource record could not be packed into its wire form.
    Wire(dns_types::protocol::serialise::Error),
    /// `create` was called with a name that normalizes to an existing
    /// identifier.
    AlreadyExists(String),
    /// The named group does not exist.
    NotFound(String),
    /// The supplied value could not be turned into a resource record.
    TypeNotSupported(String),
    /// The supplied address text was not a valid IP address.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Encode(e) => write!(f, "record store encoding error: {e}"),
            Error::Yaml(e) => write!(f, "group catalogue error: {e}"),
            Error::Wire(e) => write!(f, "wire encoding error: {e}"),
            Error::AlreadyExists(id) => write!(f, "group '{id}' already exists"),
            Error::NotFound(id) => write!(f, "group '{id}' not found"),
            Error::TypeNotSupported(t) => write!(f, "record type '{t}' is not supported here"),
            Error::InvalidAddress(a) => write!(f, "'{a}' is not a valid IP address"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Encode(e) => Some(e),
            Error::Yaml(e) => Some(e),
            Error::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encode(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Yaml(e)
    }
}

impl From<dns_types::protocol::serialise::Error> for Error {
    fn from(e: dns_types::protocol::serialise::Error) -> Self {
        Error::Wire(e)
    }
}
