use warden_types::events::{SessionDeleted, SessionExpireSoon};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Deleted(SessionDeleted),
    ExpireSoon(SessionExpireSoon),
}

impl SessionEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Deleted(_) => SessionDeleted::NAME,
            SessionEvent::ExpireSoon(_) => SessionExpireSoon::NAME,
        }
    }
}

/// Where session lifecycle events go. The expired token remover is the
/// only producer; the actual message bus wiring lives outside this crate.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

/// Publisher used when no message bus is attached: events are only traced.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: SessionEvent) {
        tracing::debug!(name = event.name(), ?event, "publishing session event");
    }
}
