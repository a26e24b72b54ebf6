//! Stable identifiers for the three entity kinds the store tracks.
//!
//! All three are newtypes over `String` rather than interned symbols: keys
//! are content-derived and arrive already-computed from clients, worker
//! addresses double as their own routing address, and client ids are opaque.
//! Wrapping them distinguishes "a task key" from "a worker address" at the
//! type level so a mixed-up argument order is a compile error, not a 3am
//! incident.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskKey(pub String);

impl TaskKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A worker's network address. Doubles as its routing address and its
/// identity: the scheduler never assigns workers a separate surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct WorkerAddr(pub String);

impl WorkerAddr {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerAddr {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerAddr {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lexicographically-ordered tie-break for dispatch (spec §4.3.3):
/// `(generation, submission_counter)`. Lower sorts first. `generation` is
/// bumped per distinct `update-graph` call from a client so that an earlier
/// graph's tasks always out-prioritize a later one's, and
/// `submission_counter` orders tasks within the same graph by the sequence
/// they were declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Priority(pub i64, pub i64);

impl Priority {
    #[must_use]
    pub fn new(generation: i64, counter: i64) -> Self {
        Self(generation, counter)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_lexicographically() {
        assert!(Priority::new(0, 5) < Priority::new(1, 0));
        assert!(Priority::new(1, 0) < Priority::new(1, 1));
        assert_eq!(Priority::new(2, 3), Priority::new(2, 3));
    }

    #[test]
    fn task_key_displays_its_inner_string() {
        let key = TaskKey::from("inc-ab31c010");
        assert_eq!(key.to_string(), "inc-ab31c010");
        assert_eq!(key.as_str(), "inc-ab31c010");
    }
}
