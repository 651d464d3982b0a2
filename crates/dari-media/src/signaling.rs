//! Call signaling over the shared mailbox.
//!
//! Layout in the store:
//!
//! ```text
//! calls/{callId}                    CallRecord (offer, answer, callerId, calleeId, callType)
//! calls/{callId}/offerCandidates    caller's ICE candidates
//! calls/{callId}/answerCandidates   callee's ICE candidates
//! ```
//!
//! Every operation requires an authenticated identity. Transient store
//! failures are retried with exponential backoff before they surface as
//! [`SignalingError::StoreUnavailable`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dari_shared::constants::{
    ANSWER_CANDIDATES, CALLS_COLLECTION, DEFAULT_STORE_RETRY_ATTEMPTS,
    DEFAULT_STORE_RETRY_BACKOFF_MS, OFFER_CANDIDATES,
};
use dari_shared::{
    CallId, CallRecord, CallType, IceCandidate, ProtocolError, Role, SdpType, SessionDescription,
    UserId,
};
use dari_store::{
    subcollection, Document, DocumentChange, DocumentStore, Precondition, StoreError, Subscription,
};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("mailbox unavailable: {0}")]
    StoreUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("call {0} not found")]
    CallNotFound(CallId),

    #[error("call {0} was already answered")]
    AlreadyAnswered(CallId),

    #[error("malformed mailbox data: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("mailbox error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SignalingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SignalingError::StoreUnavailable(msg),
            StoreError::PermissionDenied(msg) => SignalingError::PermissionDenied(msg),
            other => SignalingError::Store(other),
        }
    }
}

/// Retry schedule for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_STORE_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `retry` (0-based): doubling backoff plus up
    /// to half the base delay of jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let backoff = self.base_delay.saturating_mul(1u32 << retry.min(16));
        let jitter_ms = self.base_delay.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && retry + 1 < self.attempts => {
                    let delay = self.delay(retry);
                    warn!(op = what, attempt = retry + 1, ?delay, error = %e, "Mailbox busy, retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }
}

/// Mailbox operations for one local user.
#[derive(Clone)]
pub struct MailboxChannel {
    store: Arc<dyn DocumentStore>,
    identity: Option<UserId>,
    retry: RetryPolicy,
}

/// Errors from addressing one call. An id the store cannot address, such as
/// a mistyped `abc/def`, names no call either.
fn lookup_error(call_id: &CallId, err: StoreError) -> SignalingError {
    match err {
        StoreError::NotFound | StoreError::InvalidPath(_) => {
            SignalingError::CallNotFound(call_id.clone())
        }
        other => other.into(),
    }
}

fn candidates_path(call_id: &CallId, name: &str) -> String {
    subcollection(CALLS_COLLECTION, call_id.as_str(), name)
}

impl MailboxChannel {
    /// `identity` is `None` for an unauthenticated session; every operation
    /// then fails with [`SignalingError::PermissionDenied`].
    pub fn new(store: Arc<dyn DocumentStore>, identity: Option<UserId>) -> Self {
        Self {
            store,
            identity,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn identity(&self) -> Result<&UserId, SignalingError> {
        self.identity
            .as_ref()
            .ok_or_else(|| SignalingError::PermissionDenied("not signed in".into()))
    }

    /// Create a new call record carrying `offer`. The returned id has to
    /// reach the other party out of band.
    pub async fn publish_offer(
        &self,
        offer: &SessionDescription,
        call_type: CallType,
    ) -> Result<CallId, SignalingError> {
        let caller = self.identity()?;
        offer.validate_as(SdpType::Offer)?;
        let doc = CallRecord::offer_document(offer, caller, call_type)?;

        let id = self
            .retry
            .run("publish_offer", || self.store.create(CALLS_COLLECTION, doc.clone()))
            .await?;
        let call_id = CallId::new(id);
        info!(call_id = %call_id, caller = %caller.short(), %call_type, "Call offer published");
        Ok(call_id)
    }

    pub async fn fetch_call(&self, call_id: &CallId) -> Result<CallRecord, SignalingError> {
        self.identity()?;
        let doc = self
            .retry
            .run("fetch_call", || self.store.get(CALLS_COLLECTION, call_id.as_str()))
            .await
            .map_err(|e| lookup_error(call_id, e))?
            .ok_or_else(|| SignalingError::CallNotFound(call_id.clone()))?;
        Ok(CallRecord::from_document(call_id.clone(), doc.data)?)
    }

    /// Attach the local answer and identity to the record, exactly once.
    pub async fn fetch_and_answer(
        &self,
        call_id: &CallId,
        answer: &SessionDescription,
    ) -> Result<CallRecord, SignalingError> {
        let callee = self.identity()?;
        answer.validate_as(SdpType::Answer)?;

        let record = self.fetch_call(call_id).await?;
        if record.is_answered() {
            return Err(SignalingError::AlreadyAnswered(call_id.clone()));
        }

        let mut patch = serde_json::Map::new();
        patch.insert("answer".into(), serde_json::to_value(answer).map_err(ProtocolError::from)?);
        patch.insert("calleeId".into(), serde_json::Value::String(callee.as_str().to_string()));

        // The precondition closes the race between two joiners.
        let updated = self
            .retry
            .run("fetch_and_answer", || {
                self.store.update(
                    CALLS_COLLECTION,
                    call_id.as_str(),
                    patch.clone(),
                    Precondition::FieldAbsent("answer".into()),
                )
            })
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed(_) => SignalingError::AlreadyAnswered(call_id.clone()),
                other => lookup_error(call_id, other),
            })?;

        info!(call_id = %call_id, callee = %callee.short(), "Call answered");
        Ok(CallRecord::from_document(call_id.clone(), updated.data)?)
    }

    /// Stream that yields the answer once it appears on the record.
    pub async fn watch_answer(&self, call_id: &CallId) -> Result<AnswerWatch, SignalingError> {
        self.identity()?;
        let subscription = self
            .retry
            .run("watch_answer", || {
                self.store.watch_document(CALLS_COLLECTION, call_id.as_str())
            })
            .await
            .map_err(|e| lookup_error(call_id, e))?;
        Ok(AnswerWatch {
            call_id: call_id.clone(),
            subscription,
            done: false,
        })
    }

    /// Watch for the caller deleting the call record.
    pub async fn watch_removal(&self, call_id: &CallId) -> Result<RemovalWatch, SignalingError> {
        self.identity()?;
        let subscription = self
            .retry
            .run("watch_removal", || {
                self.store.watch_document(CALLS_COLLECTION, call_id.as_str())
            })
            .await
            .map_err(|e| lookup_error(call_id, e))?;
        Ok(RemovalWatch { subscription })
    }

    pub async fn publish_local_candidate(
        &self,
        call_id: &CallId,
        role: Role,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        self.identity()?;
        let path = candidates_path(call_id, role.local_candidates());
        let data = candidate.to_json()?;
        self.retry
            .run("publish_local_candidate", || self.store.create(&path, data.clone()))
            .await?;
        debug!(call_id = %call_id, ?role, "Local candidate published");
        Ok(())
    }

    /// Every candidate the other side has published, existing ones first.
    pub async fn watch_remote_candidates(
        &self,
        call_id: &CallId,
        role: Role,
    ) -> Result<CandidateWatch, SignalingError> {
        self.identity()?;
        let path = candidates_path(call_id, role.remote_candidates());
        let subscription = self
            .retry
            .run("watch_remote_candidates", || self.store.watch_collection(&path))
            .await?;
        Ok(CandidateWatch {
            subscription,
            seen: HashSet::new(),
        })
    }

    /// Delete both candidate lists and the record. Only the caller that
    /// created the record may do this. Returns whether the record existed.
    pub async fn teardown(&self, call_id: &CallId) -> Result<bool, SignalingError> {
        let uid = self.identity()?;
        let existing = self
            .retry
            .run("teardown", || self.store.get(CALLS_COLLECTION, call_id.as_str()))
            .await
            .map_err(|e| lookup_error(call_id, e))?;
        if let Some(doc) = &existing {
            let record = CallRecord::from_document(call_id.clone(), doc.data.clone())?;
            if &record.caller_id != uid {
                return Err(SignalingError::PermissionDenied(format!(
                    "call {call_id} belongs to another user"
                )));
            }
        }

        let removed = self.delete_call(call_id).await?;
        info!(call_id = %call_id, removed, "Call torn down");
        Ok(removed)
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<bool, SignalingError> {
        for name in [OFFER_CANDIDATES, ANSWER_CANDIDATES] {
            let path = candidates_path(call_id, name);
            let docs = self
                .retry
                .run("list_candidates", || self.store.list(&path))
                .await?;
            for doc in docs {
                self.retry
                    .run("delete_candidate", || self.store.delete(&path, &doc.id))
                    .await?;
            }
        }
        Ok(self
            .retry
            .run("delete_call", || self.store.delete(CALLS_COLLECTION, call_id.as_str()))
            .await?)
    }

    /// Delete unanswered records older than `ttl`. Answered records and
    /// unreadable ones are left alone. Returns the deleted ids.
    pub async fn sweep_abandoned(&self, ttl: Duration) -> Result<Vec<CallId>, SignalingError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36500));
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let calls = self
            .retry
            .run("sweep_list", || self.store.list(CALLS_COLLECTION))
            .await?;

        let mut swept = Vec::new();
        for doc in calls {
            let call_id = CallId::new(doc.id.clone());
            let record = match CallRecord::from_document(call_id.clone(), doc.data) {
                Ok(record) => record,
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "Skipping unreadable call record");
                    continue;
                }
            };
            if record.is_answered() || record.created_at >= cutoff {
                continue;
            }
            self.delete_call(&call_id).await?;
            swept.push(call_id);
        }
        if !swept.is_empty() {
            info!(count = swept.len(), "Abandoned calls swept");
        }
        Ok(swept)
    }
}

/// Yields the callee's answer once, then ends.
pub struct AnswerWatch {
    call_id: CallId,
    subscription: Subscription<Option<Document>>,
    done: bool,
}

impl AnswerWatch {
    /// `Err(CallNotFound)` if the record disappears before it is answered.
    pub async fn next(&mut self) -> Option<Result<SessionDescription, SignalingError>> {
        if self.done {
            return None;
        }
        while let Some(snapshot) = self.subscription.next().await {
            let Some(doc) = snapshot else {
                self.done = true;
                return Some(Err(SignalingError::CallNotFound(self.call_id.clone())));
            };
            match CallRecord::from_document(self.call_id.clone(), doc.data) {
                Ok(CallRecord {
                    answer: Some(answer),
                    ..
                }) => {
                    self.done = true;
                    return Some(Ok(answer));
                }
                Ok(_) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

pub struct RemovalWatch {
    subscription: Subscription<Option<Document>>,
}

impl RemovalWatch {
    /// `true` once the record is gone, `false` if the watch ends first.
    pub async fn removed(&mut self) -> bool {
        while let Some(snapshot) = self.subscription.next().await {
            if snapshot.is_none() {
                return true;
            }
        }
        false
    }
}

/// Remote candidates in store order, each once.
pub struct CandidateWatch {
    subscription: Subscription<DocumentChange>,
    seen: HashSet<String>,
}

impl CandidateWatch {
    /// A malformed candidate yields an error item; the stream continues.
    pub async fn next(&mut self) -> Option<Result<IceCandidate, SignalingError>> {
        while let Some(change) = self.subscription.next().await {
            let DocumentChange::Added(doc) = change else {
                continue;
            };
            if !self.seen.insert(doc.id.clone()) {
                continue;
            }
            return Some(IceCandidate::from_json(doc.data).map_err(SignalingError::from));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dari_store::SqliteMailbox;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn mailbox() -> Arc<SqliteMailbox> {
        Arc::new(SqliteMailbox::open_in_memory().unwrap())
    }

    fn channel(store: &Arc<SqliteMailbox>, user: &str) -> MailboxChannel {
        MailboxChannel::new(store.clone(), Some(UserId::new(user)))
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n")
    }

    fn answer() -> SessionDescription {
        SessionDescription::answer("v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\n")
    }

    #[tokio::test]
    async fn test_publish_offer_creates_unanswered_record() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();

        let record = alice.fetch_call(&id).await.unwrap();
        assert_eq!(record.call_type, CallType::Audio);
        assert_eq!(record.caller_id, UserId::new("alice"));
        assert!(record.answer.is_none());
        assert!(record.callee_id.is_none());
    }

    #[tokio::test]
    async fn test_second_answer_is_rejected() {
        let store = mailbox();
        let id = channel(&store, "alice")
            .publish_offer(&offer(), CallType::Video)
            .await
            .unwrap();

        let bob = channel(&store, "bob");
        let record = bob.fetch_and_answer(&id, &answer()).await.unwrap();
        assert_eq!(record.callee_id, Some(UserId::new("bob")));
        assert_eq!(record.answer, Some(answer()));

        let carol = channel(&store, "carol");
        assert!(matches!(
            carol.fetch_and_answer(&id, &answer()).await,
            Err(SignalingError::AlreadyAnswered(_))
        ));
        assert_eq!(
            bob.fetch_call(&id).await.unwrap().callee_id,
            Some(UserId::new("bob"))
        );
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_found() {
        let store = mailbox();
        let bob = channel(&store, "bob");
        assert!(matches!(
            bob.fetch_and_answer(&CallId::new("nope"), &answer()).await,
            Err(SignalingError::CallNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unaddressable_id_is_not_found() {
        let store = mailbox();
        let bob = channel(&store, "bob");
        for pasted in ["abc/def", ""] {
            let id = CallId::new(pasted);
            assert!(matches!(
                bob.fetch_call(&id).await,
                Err(SignalingError::CallNotFound(_))
            ));
            assert!(matches!(
                bob.fetch_and_answer(&id, &answer()).await,
                Err(SignalingError::CallNotFound(_))
            ));
            assert!(matches!(
                bob.watch_answer(&id).await,
                Err(SignalingError::CallNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_is_denied() {
        let store = mailbox();
        let anonymous = MailboxChannel::new(store.clone(), None);
        assert!(matches!(
            anonymous.publish_offer(&offer(), CallType::Audio).await,
            Err(SignalingError::PermissionDenied(_))
        ));
        assert!(store.list(CALLS_COLLECTION).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_answer_emits_once() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();
        let mut watch = alice.watch_answer(&id).await.unwrap();

        channel(&store, "bob")
            .fetch_and_answer(&id, &answer())
            .await
            .unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap(), answer());
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_answer_reports_deleted_record() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();
        let mut watch = alice.watch_answer(&id).await.unwrap();
        alice.teardown(&id).await.unwrap();
        assert!(matches!(
            watch.next().await,
            Some(Err(SignalingError::CallNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_removal_watch_waits_for_teardown() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let bob = channel(&store, "bob");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();
        bob.fetch_and_answer(&id, &answer()).await.unwrap();

        let mut removal = bob.watch_removal(&id).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), removal.removed()).await;
        assert!(pending.is_err());

        alice.teardown(&id).await.unwrap();
        assert!(removal.removed().await);
    }

    #[tokio::test]
    async fn test_candidates_cross_between_roles_in_order() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let bob = channel(&store, "bob");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();

        for n in 0..2 {
            alice
                .publish_local_candidate(&id, Role::Caller, &IceCandidate::new(format!("candidate:{n}")))
                .await
                .unwrap();
        }
        let mut from_caller = bob.watch_remote_candidates(&id, Role::Callee).await.unwrap();
        alice
            .publish_local_candidate(&id, Role::Caller, &IceCandidate::new("candidate:2"))
            .await
            .unwrap();
        bob.publish_local_candidate(&id, Role::Callee, &IceCandidate::new("candidate:b"))
            .await
            .unwrap();

        for n in 0..3 {
            let candidate = from_caller.next().await.unwrap().unwrap();
            assert_eq!(candidate.candidate, format!("candidate:{n}"));
        }

        let mut from_callee = alice.watch_remote_candidates(&id, Role::Caller).await.unwrap();
        assert_eq!(
            from_callee.next().await.unwrap().unwrap().candidate,
            "candidate:b"
        );
    }

    #[tokio::test]
    async fn test_malformed_candidate_does_not_end_stream() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();
        let path = candidates_path(&id, OFFER_CANDIDATES);
        store.create(&path, json!({ "bogus": true })).await.unwrap();
        alice
            .publish_local_candidate(&id, Role::Caller, &IceCandidate::new("candidate:ok"))
            .await
            .unwrap();

        let mut watch = channel(&store, "bob")
            .watch_remote_candidates(&id, Role::Callee)
            .await
            .unwrap();
        assert!(matches!(
            watch.next().await,
            Some(Err(SignalingError::Malformed(_)))
        ));
        assert_eq!(watch.next().await.unwrap().unwrap().candidate, "candidate:ok");
    }

    #[tokio::test]
    async fn test_teardown_removes_everything_and_is_caller_only() {
        let store = mailbox();
        let alice = channel(&store, "alice");
        let bob = channel(&store, "bob");
        let id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();
        bob.fetch_and_answer(&id, &answer()).await.unwrap();
        alice
            .publish_local_candidate(&id, Role::Caller, &IceCandidate::new("candidate:a"))
            .await
            .unwrap();
        bob.publish_local_candidate(&id, Role::Callee, &IceCandidate::new("candidate:b"))
            .await
            .unwrap();

        assert!(matches!(
            bob.teardown(&id).await,
            Err(SignalingError::PermissionDenied(_))
        ));
        assert!(alice.fetch_call(&id).await.is_ok());

        assert!(alice.teardown(&id).await.unwrap());
        assert!(!alice.teardown(&id).await.unwrap());
        assert!(matches!(
            bob.fetch_call(&id).await,
            Err(SignalingError::CallNotFound(_))
        ));
        assert!(store
            .list(&candidates_path(&id, OFFER_CANDIDATES))
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .list(&candidates_path(&id, ANSWER_CANDIDATES))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_unanswered_records() {
        let store = mailbox();
        let alice = channel(&store, "alice");

        let stale = CallRecord {
            created_at: Utc::now() - chrono::Duration::hours(2),
            ..CallRecord::new(CallId::new("x"), offer(), UserId::new("alice"), CallType::Audio)
        };
        let stale_id = store
            .create(CALLS_COLLECTION, stale.to_document().unwrap())
            .await
            .unwrap();
        let stale_answered = CallRecord {
            answer: Some(answer()),
            ..stale.clone()
        };
        let answered_id = store
            .create(CALLS_COLLECTION, stale_answered.to_document().unwrap())
            .await
            .unwrap();
        let fresh_id = alice.publish_offer(&offer(), CallType::Audio).await.unwrap();
        store
            .create(
                &candidates_path(&CallId::new(stale_id.clone()), OFFER_CANDIDATES),
                json!({ "candidate": "c" }),
            )
            .await
            .unwrap();

        let swept = alice.sweep_abandoned(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(swept, vec![CallId::new(stale_id.clone())]);
        assert!(store.get(CALLS_COLLECTION, &stale_id).await.unwrap().is_none());
        assert!(store.get(CALLS_COLLECTION, &answered_id).await.unwrap().is_some());
        assert!(alice.fetch_call(&fresh_id).await.is_ok());
        assert!(store
            .list(&candidates_path(&CallId::new(stale_id), OFFER_CANDIDATES))
            .await
            .unwrap()
            .is_empty());
    }

    /// Store that reports itself busy a fixed number of times.
    struct FlakyStore {
        inner: Arc<SqliteMailbox>,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn busy(&self) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn create(&self, collection: &str, data: serde_json::Value) -> Result<String, StoreError> {
            self.busy()?;
            self.inner.create(collection, data).await
        }
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            self.busy()?;
            self.inner.get(collection, id).await
        }
        async fn update(
            &self,
            collection: &str,
            id: &str,
            patch: serde_json::Map<String, serde_json::Value>,
            precondition: Precondition,
        ) -> Result<Document, StoreError> {
            self.busy()?;
            self.inner.update(collection, id, patch, precondition).await
        }
        async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
            self.busy()?;
            self.inner.delete(collection, id).await
        }
        async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
            self.busy()?;
            self.inner.list(collection).await
        }
        async fn watch_document(
            &self,
            collection: &str,
            id: &str,
        ) -> Result<Subscription<Option<Document>>, StoreError> {
            self.busy()?;
            self.inner.watch_document(collection, id).await
        }
        async fn watch_collection(
            &self,
            collection: &str,
        ) -> Result<Subscription<DocumentChange>, StoreError> {
            self.busy()?;
            self.inner.watch_collection(collection).await
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(FlakyStore {
            inner: mailbox(),
            failures: AtomicU32::new(2),
        });
        let alice = MailboxChannel::new(flaky.clone(), Some(UserId::new("alice")))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)));
        assert!(alice.publish_offer(&offer(), CallType::Audio).await.is_ok());

        flaky.failures.store(5, Ordering::SeqCst);
        assert!(matches!(
            alice.publish_offer(&offer(), CallType::Audio).await,
            Err(SignalingError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let first = policy.delay(0);
        let third = policy.delay(2);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(450));
    }
}
