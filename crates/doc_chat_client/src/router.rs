//! Dispatch of decoded server events onto pending requests and caller callbacks.

use tracing::{debug, warn};

use crate::messages::{AssistantDoneMessage, ChatIdMessage, Citation, ErrorMessage, ServerEvent};
use crate::registry::{PendingRequest, RegistryError, RequestRegistry};

/// The server assigned (or confirmed) a conversation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationAssignment {
    pub request_id: String,
    pub conversation_id: u64,
    pub title: Option<String>,
}

/// An error reported to the caller. `request_id` is set only when the error
/// was correlated with a pending request, which has been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub request_id: Option<String>,
    pub detail: String,
    pub code: Option<String>,
}

type AssignedFn = Box<dyn FnMut(&ConversationAssignment) + Send>;
type StartFn = Box<dyn FnMut(&str, &str) + Send>;
type DeltaFn = Box<dyn FnMut(&str, &str) + Send>;
type CitationsFn = Box<dyn FnMut(&str, &[Citation]) + Send>;
type DoneFn = Box<dyn FnMut(&PendingRequest) + Send>;
type ErrorFn = Box<dyn FnMut(&ErrorNotice) + Send>;

/// Callbacks the engine invokes. Every slot is optional.
///
/// ```
/// use doc_chat_client::Handlers;
///
/// let handlers = Handlers::new()
///     .on_delta(|_request_id, delta| print!("{delta}"))
///     .on_done(|done| println!("\n[{} chars]", done.content.len()));
/// # drop(handlers);
/// ```
#[derive(Default)]
pub struct Handlers {
    conversation_assigned: Option<AssignedFn>,
    start: Option<StartFn>,
    delta: Option<DeltaFn>,
    citations: Option<CitationsFn>,
    done: Option<DoneFn>,
    error: Option<ErrorFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_conversation_assigned(
        mut self,
        f: impl FnMut(&ConversationAssignment) + Send + 'static,
    ) -> Self {
        self.conversation_assigned = Some(Box::new(f));
        self
    }

    /// `(request_id, assistant_message_id)`
    pub fn on_start(mut self, f: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.start = Some(Box::new(f));
        self
    }

    /// `(request_id, delta)`
    pub fn on_delta(mut self, f: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.delta = Some(Box::new(f));
        self
    }

    pub fn on_citations(mut self, f: impl FnMut(&str, &[Citation]) + Send + 'static) -> Self {
        self.citations = Some(Box::new(f));
        self
    }

    /// Receives the fully assembled request after it left the registry.
    pub fn on_done(mut self, f: impl FnMut(&PendingRequest) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&ErrorNotice) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    fn emit_error(&mut self, notice: &ErrorNotice) {
        if let Some(f) = self.error.as_mut() {
            f(notice);
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("conversation_assigned", &self.conversation_assigned.is_some())
            .field("start", &self.start.is_some())
            .field("delta", &self.delta.is_some())
            .field("citations", &self.citations.is_some())
            .field("done", &self.done.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Owns the registry; the only component that mutates its entries.
#[derive(Debug)]
pub struct StreamRouter {
    registry: RequestRegistry,
    handlers: Handlers,
}

impl StreamRouter {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            registry: RequestRegistry::new(),
            handlers,
        }
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Track a request that is about to be sent.
    pub fn begin(&mut self, request_id: &str, conversation_id: u64) -> Result<(), RegistryError> {
        self.registry.register(request_id, conversation_id)?;
        Ok(())
    }

    /// Forget a request locally. No callback fires and the server is not told.
    pub fn dispose(&mut self, request_id: &str) -> bool {
        self.registry.discard(request_id).is_some()
    }

    /// Forget every request without callbacks.
    pub fn dispose_all(&mut self) -> Vec<PendingRequest> {
        self.registry.drain()
    }

    pub fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ChatId(m) => self.on_chat_id(m),
            ServerEvent::AssistantStart(m) => {
                let Some(request) = self.registry.get_mut(&m.request_id) else {
                    debug!(
                        request_id = %m.request_id,
                        "dropping assistant_start for unknown request"
                    );
                    return;
                };
                request.start_streaming();
                request.assistant_message_id = Some(m.assistant_message_id.clone());
                if let Some(f) = self.handlers.start.as_mut() {
                    f(&m.request_id, &m.assistant_message_id);
                }
            }
            ServerEvent::AssistantDelta(m) => {
                let Some(request) = self.registry.get_mut(&m.request_id) else {
                    debug!(
                        request_id = %m.request_id,
                        "dropping assistant_delta for unknown request"
                    );
                    return;
                };
                request.append_delta(&m.delta);
                if let Some(f) = self.handlers.delta.as_mut() {
                    f(&m.request_id, &m.delta);
                }
            }
            ServerEvent::AssistantCitations(m) => {
                let Some(request) = self.registry.get_mut(&m.request_id) else {
                    debug!(
                        request_id = %m.request_id,
                        "dropping assistant_citations for unknown request"
                    );
                    return;
                };
                request.replace_citations(m.citations);
                if let Some(f) = self.handlers.citations.as_mut() {
                    f(&m.request_id, &request.citations);
                }
            }
            ServerEvent::AssistantDone(m) => self.on_done(m),
            ServerEvent::Error(m) => self.on_error(m),
            ServerEvent::Unknown { tag } => {
                debug!(%tag, "ignoring server event with unknown type");
            }
        }
    }

    /// Report a connection-scoped transport problem. The registry is untouched.
    pub fn transport_error(&mut self, detail: &str) {
        self.handlers.emit_error(&ErrorNotice {
            request_id: None,
            detail: detail.to_string(),
            code: Some("transport".to_string()),
        });
    }

    /// Fail every pending request with `detail`. Returns how many were failed.
    pub fn abandon_all(&mut self, detail: &str) -> Vec<PendingRequest> {
        let abandoned = self.registry.fail_all();
        for request in &abandoned {
            warn!(
                request_id = %request.request_id,
                "failing request abandoned by lost connection"
            );
            self.handlers.emit_error(&ErrorNotice {
                request_id: Some(request.request_id.clone()),
                detail: detail.to_string(),
                code: Some("connection_lost".to_string()),
            });
        }
        abandoned
    }

    fn on_chat_id(&mut self, m: ChatIdMessage) {
        if let Some(request) = self.registry.get_mut(&m.request_id) {
            request.conversation_id = m.conversation_id;
        }
        if let Some(f) = self.handlers.conversation_assigned.as_mut() {
            f(&ConversationAssignment {
                request_id: m.request_id,
                conversation_id: m.conversation_id,
                title: m.title,
            });
        }
    }

    fn on_done(&mut self, m: AssistantDoneMessage) {
        let Some(mut request) = self.registry.complete(&m.request_id) else {
            debug!(request_id = %m.request_id, "dropping assistant_done for unknown request");
            return;
        };
        request.message_id = m.message_id;
        request.timing_ms = m.timing_ms;
        if let Some(conversation_id) = m.conversation_id {
            request.conversation_id = conversation_id;
        }
        if let Some(citations) = m.citations {
            request.replace_citations(citations);
        }
        if let Some(answer) = m.answer {
            if request.content.is_empty() {
                request.content = answer;
            }
        }
        if let Some(f) = self.handlers.done.as_mut() {
            f(&request);
        }
    }

    fn on_error(&mut self, m: ErrorMessage) {
        let Some(request_id) = m.request_id else {
            warn!(detail = %m.detail, "server reported a connection error");
            self.handlers.emit_error(&ErrorNotice {
                request_id: None,
                detail: m.detail,
                code: m.code,
            });
            return;
        };
        if self.registry.fail(&request_id).is_none() {
            debug!(%request_id, "dropping error for unknown request");
            return;
        }
        self.handlers.emit_error(&ErrorNotice {
            request_id: Some(request_id),
            detail: m.detail,
            code: m.code,
        });
    }
}
