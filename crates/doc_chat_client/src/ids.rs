//! Request id generation. Ids only need to be unique among in-flight requests.

use uuid::Uuid;

/// Produces unique request ids for outbound messages.
pub trait RequestIdSource: Send {
    fn next_id(&mut self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidRequestIds;

impl RequestIdSource for UuidRequestIds {
    fn next_id(&mut self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `<epoch>-<counter>`: a random per-process epoch and a monotonic counter.
#[derive(Debug, Clone)]
pub struct SequentialRequestIds {
    epoch: String,
    next: u64,
}

impl SequentialRequestIds {
    pub fn new() -> Self {
        Self::with_epoch(Uuid::new_v4().simple().to_string()[..8].to_string())
    }

    pub fn with_epoch(epoch: impl Into<String>) -> Self {
        Self {
            epoch: epoch.into(),
            next: 1,
        }
    }
}

impl Default for SequentialRequestIds {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdSource for SequentialRequestIds {
    fn next_id(&mut self) -> String {
        let id = format!("{}-{}", self.epoch, self.next);
        self.next += 1;
        id
    }
}
