//! Peer identities
//!
//! An [`EndpointId`] is an opaque string, unique per process instance and
//! totally ordered lexicographically. The ordering is load-bearing: the
//! smaller id wins every tie-break in the mesh and in shared state.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, orderable peer identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id for this process
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Either this process or one of its peers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Local(EndpointId),
    Remote(EndpointId),
}

impl Endpoint {
    pub fn id(&self) -> &EndpointId {
        match self {
            Endpoint::Local(id) | Endpoint::Remote(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }
}
