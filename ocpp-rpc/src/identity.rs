//! Peer identities, request ids and network paths

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, case-sensitive name of one peer (charging station or networking node)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the identity from the final path segment of an upgrade request.
    ///
    /// `/ocpp/CP001` and `/ocpp/CP001/` both yield `CP001`. Returns `None`
    /// when the path has no non-empty segment.
    pub fn from_upgrade_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or_default();
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .last()
            .map(Self::new)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Request id chosen by the sender of a CALL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for an outgoing CALL
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Local id correlating every log line and outcome of one inbound message.
/// Never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTrackingId(Uuid);

impl EventTrackingId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to grep a session's logs
        write!(f, "{}", &self.0.simple().to_string()[..12])
    }
}

/// Hops an envelope has traveled, most recent hop first.
///
/// Requests get each hop prepended; the reply carries the exact reverse and
/// is consumed from the back, one hop at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<Identity>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_hops(hops: impl IntoIterator<Item = Identity>) -> Self {
        Self(hops.into_iter().collect())
    }

    pub fn hops(&self) -> &[Identity] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.0.contains(identity)
    }

    /// Most recently added hop of a request path
    pub fn first(&self) -> Option<&Identity> {
        self.0.first()
    }

    /// Where a reply path terminates (the next hop it must reach)
    pub fn last(&self) -> Option<&Identity> {
        self.0.last()
    }

    pub fn prepend(&mut self, hop: Identity) {
        self.0.insert(0, hop);
    }

    pub fn pop_last(&mut self) -> Option<Identity> {
        self.0.pop()
    }

    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(Identity::as_str).collect();
        write!(f, "[{}]", hops.join(" > "))
    }
}
