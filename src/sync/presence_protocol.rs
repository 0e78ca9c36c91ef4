//! Presence channel link with bounded reconnect backoff
//!
//! Presence is ephemeral and high-frequency, so it rides its own channel
//! instead of the row change feed. Joining retries with exponential backoff
//! up to a fixed ceiling, then gives up with a terminal error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{PresenceChannel, PresenceEvent, PresencePayload, PresenceSubscription};

/// Retry schedule for presence joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(4000),
        }
    }
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence join gave up after {attempts} attempts: {last}")]
    GaveUp { attempts: u32, last: String },
}

/// Joined presence topic for one participant
pub struct PresenceLink {
    channel: Arc<dyn PresenceChannel>,
    session_id: String,
    participant_id: String,
    subscription: PresenceSubscription,
}

impl std::fmt::Debug for PresenceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceLink")
            .field("session_id", &self.session_id)
            .field("participant_id", &self.participant_id)
            .finish()
    }
}

impl PresenceLink {
    /// Join the session's presence topic, retrying per `policy`
    pub async fn connect(
        channel: Arc<dyn PresenceChannel>,
        session_id: &str,
        participant_id: &str,
        policy: &BackoffPolicy,
    ) -> Result<Self, PresenceError> {
        let mut retry = 0;
        loop {
            match channel.join(session_id, participant_id).await {
                Ok(subscription) => {
                    info!(session = %session_id, retries = retry, "presence connected");
                    return Ok(Self {
                        channel,
                        session_id: session_id.to_string(),
                        participant_id: participant_id.to_string(),
                        subscription,
                    });
                }
                Err(e) if retry >= policy.max_retries => {
                    warn!(session = %session_id, error = %e, "presence join giving up");
                    return Err(PresenceError::GaveUp {
                        attempts: retry + 1,
                        last: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = policy.delay_for(retry);
                    debug!(session = %session_id, error = %e, ?delay, "presence join failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Broadcast our presence attributes
    pub async fn track(&self, payload: PresencePayload) -> Result<()> {
        self.channel
            .track(&self.session_id, &self.participant_id, payload)
            .await
    }

    /// Next queued presence event without waiting
    pub fn try_next(&mut self) -> Option<PresenceEvent> {
        self.subscription.events.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<PresenceEvent> {
        self.subscription.events.recv().await
    }

    /// Leave the topic; other participants see a leave event
    pub async fn leave(self) -> Result<()> {
        self.channel
            .leave(&self.session_id, &self.participant_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, PresenceEventKind};
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let p = BackoffPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_millis(250));
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_millis(4000));
        assert_eq!(p.delay_for(9), Duration::from_millis(4000));
        assert_eq!(p.delay_for(40), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_with_backoff() {
        let backend = MemoryBackend::new();
        backend.fail_presence_joins(2);
        let start = Instant::now();

        let link = PresenceLink::connect(Arc::new(backend.clone()), "s1", "alice", &policy(5))
            .await
            .unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(750));
        assert!(waited < Duration::from_millis(1000));
        assert_eq!(link.participant_id(), "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_ceiling() {
        let backend = MemoryBackend::new();
        backend.fail_presence_joins(10);

        let err = PresenceLink::connect(Arc::new(backend.clone()), "s1", "alice", &policy(3))
            .await
            .unwrap_err();
        match err {
            PresenceError::GaveUp { attempts, .. } => assert_eq!(attempts, 4),
        }
    }

    #[tokio::test]
    async fn track_and_leave_reach_other_participants() {
        let backend = MemoryBackend::new();
        let channel: Arc<dyn PresenceChannel> = Arc::new(backend.clone());
        let mut bob = PresenceLink::connect(channel.clone(), "s1", "bob", &policy(0))
            .await
            .unwrap();
        let alice = PresenceLink::connect(channel, "s1", "alice", &policy(0))
            .await
            .unwrap();

        alice
            .track(PresencePayload {
                display_name: "Alice".into(),
                cursor: Some((3.0, 4.0)),
                online: true,
            })
            .await
            .unwrap();

        // initial sync, join, sync
        assert_eq!(bob.try_next().unwrap().kind, PresenceEventKind::Sync);
        let join = bob.try_next().unwrap();
        assert_eq!(join.kind, PresenceEventKind::Join);
        assert_eq!(join.state["alice"].cursor, Some((3.0, 4.0)));
        assert_eq!(bob.try_next().unwrap().kind, PresenceEventKind::Sync);

        alice.leave().await.unwrap();
        assert_eq!(bob.try_next().unwrap().kind, PresenceEventKind::Leave);
        assert!(backend.presence_state("s1").is_empty());
    }
}
