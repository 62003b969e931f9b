//! In-flight request state, keyed by `request_id`.

use std::collections::HashMap;

use thiserror::Error;

use crate::messages::Citation;

/// Lifecycle of one request. `Done` and `Errored` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Sent,
    Streaming,
    Done,
    Errored,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Errored)
    }
}

/// Assembled state of one request while its events arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request_id: String,
    pub conversation_id: u64,
    pub status: RequestStatus,
    pub content: String,
    pub citations: Vec<Citation>,
    pub assistant_message_id: Option<String>,
    pub message_id: Option<u64>,
    pub timing_ms: Option<u64>,
}

impl PendingRequest {
    fn new(request_id: &str, conversation_id: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            conversation_id,
            status: RequestStatus::Sent,
            content: String::new(),
            citations: Vec::new(),
            assistant_message_id: None,
            message_id: None,
            timing_ms: None,
        }
    }

    /// `Sent → Streaming`; no-op in any other state.
    pub fn start_streaming(&mut self) {
        if self.status == RequestStatus::Sent {
            self.status = RequestStatus::Streaming;
        }
    }

    pub fn append_delta(&mut self, delta: &str) {
        self.start_streaming();
        self.content.push_str(delta);
    }

    pub fn replace_citations(&mut self, citations: Vec<Citation>) {
        self.citations = citations;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("request {0} is already in flight")]
    Duplicate(String),
}

/// Request id → pending request. Entries leave on `complete`, `fail` or `discard`.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: HashMap<String, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        request_id: &str,
        conversation_id: u64,
    ) -> Result<&mut PendingRequest, RegistryError> {
        use std::collections::hash_map::Entry;
        match self.pending.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(request_id.to_string())),
            Entry::Vacant(slot) => {
                Ok(slot.insert(PendingRequest::new(request_id, conversation_id)))
            }
        }
    }

    /// The pending request with this id, if any.
    pub fn get(&self, request_id: &str) -> Option<&PendingRequest> {
        self.pending.get(request_id)
    }

    /// Mutable access for the router while a stream is assembled.
    pub fn get_mut(&mut self, request_id: &str) -> Option<&mut PendingRequest> {
        self.pending.get_mut(request_id)
    }

    /// Whether `request_id` is pending.
    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Remove the entry as finished.
    pub fn complete(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.remove_with(request_id, RequestStatus::Done)
    }

    /// Remove the entry as failed.
    pub fn fail(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.remove_with(request_id, RequestStatus::Errored)
    }

    /// Drop the entry without a terminal status (local disposal).
    pub fn discard(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id)
    }

    /// Remove every entry, in no particular order.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, request)| request).collect()
    }

    /// Remove every entry as failed, in no particular order.
    pub fn fail_all(&mut self) -> Vec<PendingRequest> {
        self.pending
            .drain()
            .map(|(_, mut request)| {
                request.status = RequestStatus::Errored;
                request
            })
            .collect()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn remove_with(
        &mut self,
        request_id: &str,
        status: RequestStatus,
    ) -> Option<PendingRequest> {
        let mut request = self.pending.remove(request_id)?;
        request.status = status;
        Some(request)
    }
}
