//! Periodic removal of abandoned call records.
//!
//! A caller that never hangs up and is never joined leaves its record
//! behind. The sweeper deletes unanswered records older than a TTL, together
//! with their candidate lists. Answered records are left to their caller.

use std::time::Duration;

use dari_media::MailboxChannel;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Sweep every `interval`, starting immediately. Abort the handle to stop.
pub fn spawn_sweeper(channel: MailboxChannel, ttl: Duration, interval: Duration) -> JoinHandle<()> {
    info!(?ttl, ?interval, "Stale call sweeper started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match channel.sweep_abandoned(ttl).await {
                Ok(swept) if swept.is_empty() => debug!("No abandoned calls"),
                Ok(swept) => info!(count = swept.len(), "Abandoned calls removed"),
                Err(e) => warn!(error = %e, "Sweep failed, will retry"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dari_shared::constants::CALLS_COLLECTION;
    use dari_shared::{CallId, CallRecord, CallType, SessionDescription, UserId};
    use dari_store::{DocumentStore, SqliteMailbox};

    fn record(age: chrono::Duration, answered: bool) -> serde_json::Value {
        let mut record = CallRecord::new(
            CallId::new("unused"),
            SessionDescription::offer("v=0\r\n"),
            UserId::new("alice"),
            CallType::Audio,
        );
        record.created_at = record.created_at - age;
        if answered {
            record.answer = Some(SessionDescription::answer("v=0\r\n"));
            record.callee_id = Some(UserId::new("bob"));
        }
        record.to_document().unwrap()
    }

    #[tokio::test]
    async fn test_sweeper_removes_only_stale_unanswered_calls() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let stale = store
            .create(CALLS_COLLECTION, record(chrono::Duration::hours(3), false))
            .await
            .unwrap();
        let answered = store
            .create(CALLS_COLLECTION, record(chrono::Duration::hours(3), true))
            .await
            .unwrap();
        let fresh = store
            .create(CALLS_COLLECTION, record(chrono::Duration::minutes(1), false))
            .await
            .unwrap();

        let channel = MailboxChannel::new(store.clone(), Some(UserId::new("janitor")));
        let sweeper = spawn_sweeper(
            channel,
            Duration::from_secs(3600),
            Duration::from_millis(20),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(CALLS_COLLECTION, &stale).await.unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "stale call never swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();

        assert!(store.get(CALLS_COLLECTION, &answered).await.unwrap().is_some());
        assert!(store.get(CALLS_COLLECTION, &fresh).await.unwrap().is_some());
    }
}
