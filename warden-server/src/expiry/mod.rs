pub mod clock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_types::events::{SessionDeleted, SessionExpireSoon};

use crate::bus::{EventPublisher, SessionEvent};
use crate::repos::{SessionSummary, TokenRepo, TokenSummary};

use self::clock::Clock;

/// Background task deleting expired tokens and their orphaned sessions,
/// and announcing session lifecycle changes on the event bus.
pub struct ExpiredTokenRemover {
    /// Token storage
    token_repo: TokenRepo,
    /// Sink for the session lifecycle events
    publisher: Arc<dyn EventPublisher>,
    /// Pause between two cleanup passes, and the lookahead window of the
    /// expire-soon notices
    cleanup_interval: Duration,
    /// Shutdown listener
    shutdown_rx: Arc<RwLock<mpsc::Receiver<()>>>,
    /// Shutdown transmitter
    shutdown_tx: mpsc::Sender<()>,
    /// Provides time information. Gives us deterministic time in tests.
    clock: Arc<dyn Clock>,
}

impl ExpiredTokenRemover {
    pub fn new(
        token_repo: TokenRepo,
        publisher: Arc<dyn EventPublisher>,
        cleanup_interval: Duration,
        clock: impl Clock,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);

        ExpiredTokenRemover {
            token_repo,
            publisher,
            cleanup_interval,
            shutdown_rx: Arc::new(RwLock::new(rx)),
            shutdown_tx: tx,
            clock: Arc::new(clock),
        }
    }

    /// Run until shutdown is signalled. Each cycle first deletes the
    /// expired rows, then announces upcoming expiries; a failing phase is
    /// logged and the loop carries on.
    #[tracing::instrument(skip(self), name = "start_expired_token_remover")]
    pub async fn start(&self) {
        let mut shutdown_rx = self.shutdown_rx.write().await;

        loop {
            let started = Instant::now();

            self.tokens_cleanup().await;
            self.tokens_notice().await;

            let elapsed = started.elapsed();
            if elapsed >= self.cleanup_interval {
                warn!(
                    ?elapsed,
                    "expired token removal is slower than its cleanup interval"
                );
            } else {
                debug!(?elapsed, "expired token removal pass done");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cleanup_interval.saturating_sub(elapsed)) => {}
                // Break loop on shutdown signal
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("expired token remover shutting down");
    }

    /// Signal the loop to exit once the phase in flight completes.
    #[tracing::instrument(skip(self), name = "stop_expired_token_remover")]
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn tokens_cleanup(&self) {
        let now = self.clock.now().timestamp();
        match self.token_repo.delete_expired_tokens_and_sessions(now).await {
            Ok((tokens, sessions)) => self.publish_for_sessions(&tokens, &sessions, deleted_event),
            Err(error) => {
                warn!(%error, "failed to remove expired tokens and sessions");
            }
        }
    }

    async fn tokens_notice(&self) {
        let now = self.clock.now().timestamp();
        let window = i64::try_from(self.cleanup_interval.as_secs()).unwrap_or(i64::MAX);
        match self.token_repo.expiring_soon(now, window).await {
            Ok((tokens, sessions)) => {
                self.publish_for_sessions(&tokens, &sessions, expire_soon_event);
            }
            Err(error) => {
                warn!(%error, "failed to get tokens and sessions that expire soon");
            }
        }
    }

    fn publish_for_sessions(
        &self,
        tokens: &[TokenSummary],
        sessions: &[SessionSummary],
        make_event: fn(Uuid, Option<String>, Option<String>) -> SessionEvent,
    ) {
        for session in sessions {
            let token = tokens.iter().find(|token| token.session_uuid == session.uuid);
            match token {
                Some(token) => self.publisher.publish(make_event(
                    session.uuid,
                    Some(token.auth_id.clone()),
                    token.tenant_uuid(),
                )),
                None => warn!(session = %session.uuid, "session without token associated"),
            }
        }
    }
}

fn deleted_event(uuid: Uuid, user_uuid: Option<String>, tenant_uuid: Option<String>) -> SessionEvent {
    SessionEvent::Deleted(SessionDeleted {
        uuid,
        user_uuid,
        tenant_uuid,
    })
}

fn expire_soon_event(
    uuid: Uuid,
    user_uuid: Option<String>,
    tenant_uuid: Option<String>,
) -> SessionEvent {
    SessionEvent::ExpireSoon(SessionExpireSoon {
        uuid,
        user_uuid,
        tenant_uuid,
    })
}
