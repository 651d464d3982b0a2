//! The call controller: the one place that knows whether this client is the
//! caller or the callee.
//!
//! At most one [`CallSession`] is live at a time. Starting or joining while
//! one is live fails with [`CallError::Busy`] before any device is touched,
//! so a double click on "call" cannot grab the microphone twice.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dari_media::{MailboxChannel, MediaDevices, TransportFactory};
use dari_shared::constants::DEFAULT_STUN_URLS;
use dari_shared::{CallId, CallType, Role};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::CallError;
use crate::events::CallEvent;
use crate::relay::RelayCredentialSource;
use crate::session::{CallSession, CallTimeouts, SessionContext};

const EVENT_CAPACITY: usize = 64;

pub struct CallController {
    channel: MailboxChannel,
    ctx: SessionContext,
    current: Mutex<Option<Arc<CallSession>>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallController {
    pub fn new(
        channel: MailboxChannel,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channel,
            ctx: SessionContext {
                devices,
                transports,
                stun_urls: DEFAULT_STUN_URLS.iter().map(|u| u.to_string()).collect(),
                relay: None,
                timeouts: CallTimeouts::default(),
            },
            current: Mutex::new(None),
            events,
        }
    }

    pub fn with_stun_urls(mut self, urls: Vec<String>) -> Self {
        self.ctx.stun_urls = urls;
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelayCredentialSource>) -> Self {
        self.ctx.relay = Some(relay);
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.ctx.timeouts = timeouts;
        self
    }

    pub fn with_answer_timeout(mut self, limit: Duration) -> Self {
        self.ctx.timeouts.answer = limit;
        self
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<CallSession>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Events for every session this controller runs.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// The live session, if any.
    pub fn active_session(&self) -> Option<Arc<CallSession>> {
        self.slot().as_ref().filter(|s| !s.is_ended()).cloned()
    }

    /// Claim the slot for a new session, or fail with `Busy`.
    fn begin(&self, role: Role, call_type: CallType) -> Result<Arc<CallSession>, CallError> {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| !s.is_ended()) {
            return Err(CallError::Busy);
        }
        let session = CallSession::new(role, call_type, self.channel.clone(), self.events.clone());
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Place a call. Returns the id the other party needs to join; getting
    /// it to them is up to the caller of this method.
    pub async fn start_call(&self, call_type: CallType) -> Result<CallId, CallError> {
        let session = self.begin(Role::Caller, call_type)?;
        info!(%call_type, "Starting call");
        session.start(&self.ctx).await
    }

    pub async fn join_call(&self, call_id: &CallId, call_type: CallType) -> Result<(), CallError> {
        let session = self.begin(Role::Callee, call_type)?;
        info!(call_id = %call_id, %call_type, "Joining call");
        session.join(&self.ctx, call_id).await
    }

    /// Hang up the current session, if there is one. Repeated calls do
    /// nothing.
    pub async fn hang_up(&self) {
        let session = self.slot().take();
        if let Some(session) = session {
            session.hang_up().await;
        }
    }

    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.active_session()
            .ok_or(CallError::NotInCall)?
            .toggle_mute()
    }

    pub fn toggle_camera(&self) -> Result<bool, CallError> {
        self.active_session()
            .ok_or(CallError::NotInCall)?
            .toggle_camera()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        stun_only, wait_for, CountingStore, FailingRelay, GatedStore, StaticRelay,
    };
    use dari_media::{
        DeviceBehavior, PeerConnectionState, SimulatedNetwork, SyntheticDevices,
    };
    use dari_shared::constants::{ANSWER_CANDIDATES, CALLS_COLLECTION, OFFER_CANDIDATES};
    use dari_shared::{IceCandidate, IceServer, UserId};
    use dari_store::{subcollection, DocumentStore, SqliteMailbox};

    struct Party {
        controller: CallController,
        devices: Arc<SyntheticDevices>,
        events: broadcast::Receiver<CallEvent>,
    }

    fn party(
        store: Arc<dyn DocumentStore>,
        user: &str,
        devices: SyntheticDevices,
        network: &SimulatedNetwork,
    ) -> Party {
        let devices = Arc::new(devices);
        let controller = CallController::new(
            MailboxChannel::new(store, Some(UserId::new(user))),
            devices.clone(),
            Arc::new(network.clone()),
        )
        .with_stun_urls(stun_only());
        let events = controller.subscribe();
        Party {
            controller,
            devices,
            events,
        }
    }

    async fn wait_connected(events: &mut broadcast::Receiver<CallEvent>) {
        wait_for(events, |e| {
            *e == CallEvent::ConnectionState(PeerConnectionState::Connected)
        })
        .await;
    }

    #[tokio::test]
    async fn test_audio_call_connects_both_sides() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        let mut bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);

        let call_id = alice.controller.start_call(CallType::Audio).await.unwrap();
        let record = store.get(CALLS_COLLECTION, call_id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.data["callType"], "audio");
        assert!(record.data.get("answer").map_or(true, |a| a.is_null()));

        bob.controller.join_call(&call_id, CallType::Audio).await.unwrap();
        let record = store.get(CALLS_COLLECTION, call_id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.data["answer"]["type"], "answer");
        assert_eq!(record.data["calleeId"], "bob");

        // Remote tracks are announced by the remote description, which
        // always lands before the connection comes up.
        for events in [&mut alice.events, &mut bob.events] {
            wait_for(events, |e| matches!(e, CallEvent::RemoteStream { .. })).await;
            wait_connected(events).await;
        }

        let session = alice.controller.active_session().unwrap();
        assert_eq!(session.role(), Role::Caller);
        assert_eq!(session.connection_state(), PeerConnectionState::Connected);
        assert_eq!(
            bob.controller.active_session().unwrap().call_id(),
            Some(call_id.clone())
        );

        // Only the caller deletes the record.
        bob.controller.hang_up().await;
        assert!(store.get(CALLS_COLLECTION, call_id.as_str()).await.unwrap().is_some());
        assert_eq!(bob.devices.live_leases(), 0);

        alice.controller.hang_up().await;
        assert!(store.get(CALLS_COLLECTION, call_id.as_str()).await.unwrap().is_none());
        for name in [OFFER_CANDIDATES, ANSWER_CANDIDATES] {
            let path = subcollection(CALLS_COLLECTION, call_id.as_str(), name);
            assert!(store.list(&path).await.unwrap().is_empty());
        }
        assert_eq!(alice.devices.live_leases(), 0);
    }

    #[tokio::test]
    async fn test_hang_up_before_join_removes_call() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        let bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);

        let call_id = alice.controller.start_call(CallType::Video).await.unwrap();
        alice.controller.hang_up().await;
        assert!(store.list(CALLS_COLLECTION).await.unwrap().is_empty());
        let path = subcollection(CALLS_COLLECTION, call_id.as_str(), OFFER_CANDIDATES);
        assert!(store.list(&path).await.unwrap().is_empty());

        let joined = bob.controller.join_call(&call_id, CallType::Video).await;
        assert_eq!(joined, Err(CallError::CallNotFound(call_id)));
        assert_eq!(bob.devices.live_leases(), 0);
    }

    #[tokio::test]
    async fn test_join_unknown_call_releases_devices() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let mut bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);

        let missing = CallId::new("never-created");
        let joined = bob.controller.join_call(&missing, CallType::Audio).await;
        assert_eq!(joined, Err(CallError::CallNotFound(missing.clone())));
        assert_eq!(bob.devices.live_leases(), 0);
        assert!(bob.controller.active_session().is_none());

        let failed = wait_for(&mut bob.events, |e| matches!(e, CallEvent::Failed { .. })).await;
        assert_eq!(
            failed,
            CallEvent::Failed {
                error: CallError::CallNotFound(missing)
            }
        );
        wait_for(&mut bob.events, |e| *e == CallEvent::Ended).await;
    }

    #[tokio::test]
    async fn test_join_mistyped_id_is_not_found() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);

        for pasted in ["abc/def", ""] {
            let id = CallId::new(pasted);
            let err = bob
                .controller
                .join_call(&id, CallType::Audio)
                .await
                .unwrap_err();
            assert_eq!(err, CallError::CallNotFound(id));
            assert!(!err.offers_retry());
            assert_eq!(err.user_message(), "This call is no longer available.");
            assert_eq!(bob.devices.live_leases(), 0);
        }
    }

    #[tokio::test]
    async fn test_denied_camera_creates_no_record() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let devices = SyntheticDevices::new().with_camera(DeviceBehavior::Deny);
        let alice = party(store.clone(), "alice", devices, &network);

        let result = alice.controller.start_call(CallType::Video).await;
        assert_eq!(
            result,
            Err(CallError::PermissionDenied(crate::Resource::Camera))
        );
        assert!(store.list(CALLS_COLLECTION).await.unwrap().is_empty());
        assert_eq!(alice.devices.live_leases(), 0);
        assert!(network.peers().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_is_busy() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);

        alice.controller.start_call(CallType::Audio).await.unwrap();
        assert_eq!(
            alice.controller.start_call(CallType::Audio).await,
            Err(CallError::Busy)
        );
        assert_eq!(
            alice.controller.join_call(&CallId::new("x"), CallType::Audio).await,
            Err(CallError::Busy)
        );
        assert_eq!(alice.devices.open_count(), 1);
        assert_eq!(store.list(CALLS_COLLECTION).await.unwrap().len(), 1);

        // The slot frees up after hang-up.
        alice.controller.hang_up().await;
        alice.controller.start_call(CallType::Audio).await.unwrap();
        assert_eq!(alice.devices.open_count(), 2);
    }

    #[tokio::test]
    async fn test_hang_up_is_idempotent() {
        let inner = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let counting = Arc::new(CountingStore::new(inner.clone()));
        let network = SimulatedNetwork::new();
        let mut alice = party(counting.clone(), "alice", SyntheticDevices::new(), &network);

        alice.controller.start_call(CallType::Audio).await.unwrap();
        let session = alice.controller.active_session().unwrap();

        session.hang_up().await;
        session.hang_up().await;
        alice.controller.hang_up().await;
        alice.controller.hang_up().await;

        assert_eq!(counting.deletes_in(CALLS_COLLECTION), 1);
        assert_eq!(alice.devices.live_leases(), 0);
        wait_for(&mut alice.events, |e| *e == CallEvent::Ended).await;
        let mut extra_ends = 0;
        while let Ok(event) = alice.events.try_recv() {
            if event == CallEvent::Ended {
                extra_ends += 1;
            }
        }
        assert_eq!(extra_ends, 0);
    }

    #[tokio::test]
    async fn test_mute_and_camera_are_local_only() {
        let inner = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let counting = Arc::new(CountingStore::new(inner.clone()));
        let network = SimulatedNetwork::new();
        let mut alice = party(counting.clone(), "alice", SyntheticDevices::new(), &network);
        let mut bob = party(counting.clone(), "bob", SyntheticDevices::new(), &network);

        assert_eq!(alice.controller.toggle_mute(), Err(CallError::NotInCall));

        let call_id = alice.controller.start_call(CallType::Video).await.unwrap();
        bob.controller.join_call(&call_id, CallType::Video).await.unwrap();
        wait_connected(&mut alice.events).await;
        wait_connected(&mut bob.events).await;
        // Let candidate publishing settle.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let writes = counting.writes();
        let offer = network.peers()[0].local_description();

        assert!(alice.controller.toggle_mute().unwrap());
        assert!(!alice.controller.toggle_camera().unwrap());
        assert!(!alice.controller.toggle_mute().unwrap());
        assert!(alice.controller.toggle_camera().unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counting.writes(), writes);
        assert_eq!(network.peers()[0].local_description(), offer);
        assert_eq!(
            alice.controller.active_session().unwrap().connection_state(),
            PeerConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_answer_timeout_cleans_up() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        alice.controller = alice
            .controller
            .with_answer_timeout(Duration::from_millis(50));

        alice.controller.start_call(CallType::Audio).await.unwrap();
        let failed = wait_for(&mut alice.events, |e| matches!(e, CallEvent::Failed { .. })).await;
        assert_eq!(
            failed,
            CallEvent::Failed {
                error: CallError::ConnectionTimeout
            }
        );
        wait_for(&mut alice.events, |e| *e == CallEvent::Ended).await;

        assert!(store.list(CALLS_COLLECTION).await.unwrap().is_empty());
        assert_eq!(alice.devices.live_leases(), 0);
        assert!(alice.controller.active_session().is_none());

        // A retry is a brand new call.
        assert!(alice.controller.start_call(CallType::Audio).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_both_sides() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::never_connecting();
        let timeouts = CallTimeouts {
            answer: Duration::from_secs(5),
            connect: Duration::from_millis(100),
        };
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        let mut bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);
        alice.controller = alice.controller.with_timeouts(timeouts);
        bob.controller = bob.controller.with_timeouts(timeouts);

        let call_id = alice.controller.start_call(CallType::Audio).await.unwrap();
        bob.controller.join_call(&call_id, CallType::Audio).await.unwrap();

        for events in [&mut alice.events, &mut bob.events] {
            let failed = wait_for(events, |e| matches!(e, CallEvent::Failed { .. })).await;
            assert_eq!(
                failed,
                CallEvent::Failed {
                    error: CallError::ConnectionTimeout
                }
            );
            wait_for(events, |e| *e == CallEvent::Ended).await;
        }
        assert!(store.get(CALLS_COLLECTION, call_id.as_str()).await.unwrap().is_none());
        assert_eq!(alice.devices.live_leases(), 0);
        assert_eq!(bob.devices.live_leases(), 0);
    }

    #[tokio::test]
    async fn test_connection_drop_recovers_and_failure_ends_call() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        let bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);

        let call_id = alice.controller.start_call(CallType::Audio).await.unwrap();
        bob.controller.join_call(&call_id, CallType::Audio).await.unwrap();
        wait_connected(&mut alice.events).await;
        let caller_peer = network.peers()[0].clone();

        caller_peer.force_state(PeerConnectionState::Disconnected);
        wait_for(&mut alice.events, |e| {
            *e == CallEvent::ConnectionState(PeerConnectionState::Disconnected)
        })
        .await;
        caller_peer.force_state(PeerConnectionState::Connected);
        wait_connected(&mut alice.events).await;
        assert!(alice.controller.active_session().is_some());

        caller_peer.force_state(PeerConnectionState::Failed);
        let failed = wait_for(&mut alice.events, |e| matches!(e, CallEvent::Failed { .. })).await;
        assert_eq!(
            failed,
            CallEvent::Failed {
                error: CallError::ConnectionTimeout
            }
        );
        wait_for(&mut alice.events, |e| *e == CallEvent::Ended).await;
        assert_eq!(alice.devices.live_leases(), 0);
        assert_eq!(caller_peer.connection_state(), PeerConnectionState::Closed);
        assert!(store.get(CALLS_COLLECTION, call_id.as_str()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callee_stops_publishing_after_record_removed() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        let bob = party(store.clone(), "bob", SyntheticDevices::new(), &network);

        let call_id = alice.controller.start_call(CallType::Audio).await.unwrap();
        bob.controller.join_call(&call_id, CallType::Audio).await.unwrap();
        wait_connected(&mut alice.events).await;

        let answers = subcollection(CALLS_COLLECTION, call_id.as_str(), ANSWER_CANDIDATES);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.list(&answers).await.unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "answer candidates missing");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        alice.controller.hang_up().await;
        let session = bob.controller.active_session().unwrap();
        while !session.is_record_removed() {
            assert!(tokio::time::Instant::now() < deadline, "removal not noticed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        network.peers()[1].trickle(IceCandidate::new(
            "candidate:9 1 udp 2122260223 192.0.2.9 50009 typ host",
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.list(&answers).await.unwrap().is_empty());
        assert!(!session.is_ended());

        bob.controller.hang_up().await;
        assert_eq!(bob.devices.live_leases(), 0);
    }

    #[tokio::test]
    async fn test_hang_up_during_publish_removes_late_record() {
        let inner = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let gated = Arc::new(GatedStore::new(inner.clone()));
        let network = SimulatedNetwork::new();
        let devices = Arc::new(SyntheticDevices::new());
        let controller = Arc::new(CallController::new(
            MailboxChannel::new(gated.clone(), Some(UserId::new("alice"))),
            devices.clone(),
            Arc::new(network.clone()),
        ));

        let caller = controller.clone();
        let start = tokio::spawn(async move { caller.start_call(CallType::Audio).await });

        gated.entered().await;
        controller.hang_up().await;
        assert_eq!(devices.live_leases(), 0);
        gated.release();

        assert_eq!(start.await.unwrap(), Err(CallError::Cancelled));
        assert!(inner.list(CALLS_COLLECTION).await.unwrap().is_empty());
        assert!(controller.active_session().is_none());
        assert_eq!(
            network.peers()[0].connection_state(),
            PeerConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn test_relay_failure_degrades_to_stun() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        alice.controller = alice.controller.with_relay(Arc::new(FailingRelay));

        alice.controller.start_call(CallType::Audio).await.unwrap();
        assert_eq!(
            network.peers()[0].ice_servers(),
            &[IceServer::stun(stun_only())][..]
        );
    }

    #[tokio::test]
    async fn test_relay_servers_follow_stun() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let turn = IceServer {
            urls: vec!["turn:relay.example.org:3478".into()],
            username: Some("u".into()),
            credential: Some("c".into()),
        };
        let mut alice = party(store.clone(), "alice", SyntheticDevices::new(), &network);
        alice.controller = alice
            .controller
            .with_relay(Arc::new(StaticRelay(vec![turn.clone()])));

        alice.controller.start_call(CallType::Audio).await.unwrap();
        assert_eq!(
            network.peers()[0].ice_servers(),
            &[IceServer::stun(stun_only()), turn][..]
        );
    }

    #[tokio::test]
    async fn test_unauthenticated_start_is_denied() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let network = SimulatedNetwork::new();
        let devices = Arc::new(SyntheticDevices::new());
        let controller = CallController::new(
            MailboxChannel::new(store.clone(), None),
            devices.clone(),
            Arc::new(network),
        );

        assert_eq!(
            controller.start_call(CallType::Audio).await,
            Err(CallError::PermissionDenied(crate::Resource::Mailbox))
        );
        assert_eq!(devices.live_leases(), 0);
    }
}
