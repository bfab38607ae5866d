//! Shape id generation.

use crate::shapes::ShapeId;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Produces ids that are unique within a session.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> ShapeId;
}

/// Monotonic ids of the form `<prefix>-<n>`.
///
/// The prefix should be unique per client (the client id works) so that two
/// clients never mint the same id.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> ShapeId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

/// Random v4 UUID ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self) -> ShapeId {
        Uuid::new_v4().to_string()
    }
}
