//! One call attempt.
//!
//! A [`CallSession`] is created per attempt and never reused. It owns the
//! local stream, the negotiator and the background tasks that move
//! candidates and the answer through the mailbox. [`CallSession::hang_up`]
//! is the single cleanup path: user hang-up, setup errors and timeouts all
//! end there.
//!
//! Setup steps check whether the session was hung up after every
//! suspension point. A resource that arrives after hang-up is released on
//! the spot, and a call record published after hang-up is deleted at once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dari_media::{
    AnswerWatch, CandidateDisposition, CandidateWatch, LocalStream, MailboxChannel, MediaDevices,
    NegotiationError, Negotiator, NegotiatorEvent, NegotiatorEvents, PeerConnectionState,
    RemovalWatch, TransportFactory,
};
use dari_shared::constants::{DEFAULT_ANSWER_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS};
use dari_shared::{CallId, CallType, Role, SessionDescription};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::events::CallEvent;
use crate::relay::{resolve_ice_servers, RelayCredentialSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Caller only: time allowed for the answer to appear.
    pub answer: Duration,
    /// Time allowed for the connection to reach `connected` once both
    /// descriptions are in place.
    pub connect: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            answer: Duration::from_secs(DEFAULT_ANSWER_TIMEOUT_SECS),
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Everything a session borrows from its controller during setup.
pub(crate) struct SessionContext {
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub stun_urls: Vec<String>,
    pub relay: Option<Arc<dyn RelayCredentialSource>>,
    pub timeouts: CallTimeouts,
}

#[derive(Default)]
struct Resources {
    call_id: Option<CallId>,
    stream: Option<Arc<LocalStream>>,
    negotiator: Option<Arc<Negotiator>>,
    tasks: Vec<JoinHandle<()>>,
    ended: bool,
}

pub struct CallSession {
    role: Role,
    call_type: CallType,
    channel: MailboxChannel,
    events: broadcast::Sender<CallEvent>,
    resources: Mutex<Resources>,
    failed: AtomicBool,
    record_removed: AtomicBool,
}

impl CallSession {
    pub(crate) fn new(
        role: Role,
        call_type: CallType,
        channel: MailboxChannel,
        events: broadcast::Sender<CallEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            call_type,
            channel,
            events,
            resources: Mutex::new(Resources::default()),
            failed: AtomicBool::new(false),
            record_removed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Known once the offer is published (caller) or from the start (callee).
    pub fn call_id(&self) -> Option<CallId> {
        self.lock().call_id.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    /// Callee only: the caller has deleted the call record.
    pub fn is_record_removed(&self) -> bool {
        self.record_removed.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        let resources = self.lock();
        match &resources.negotiator {
            Some(negotiator) => negotiator.state(),
            None if resources.ended => PeerConnectionState::Closed,
            None => PeerConnectionState::New,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.lock().stream.as_ref().map_or(true, |s| s.is_muted())
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.lock()
            .stream
            .as_ref()
            .map_or(false, |s| s.is_camera_enabled())
    }

    /// Returns whether audio is now muted. Local only: nothing is written to
    /// the mailbox and nothing is renegotiated.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let resources = self.lock();
        let stream = resources.stream.as_ref().ok_or(CallError::NotInCall)?;
        let muted = stream.toggle_mute();
        info!(muted, "Mute toggled");
        Ok(muted)
    }

    /// Returns whether the camera is now sending.
    pub fn toggle_camera(&self) -> Result<bool, CallError> {
        let resources = self.lock();
        let stream = resources.stream.as_ref().ok_or(CallError::NotInCall)?;
        let enabled = stream.toggle_camera();
        info!(enabled, "Camera toggled");
        Ok(enabled)
    }

    fn emit(&self, event: CallEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.is_ended() {
            Err(CallError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn install_stream(&self, stream: Arc<LocalStream>) -> Result<(), CallError> {
        let mut resources = self.lock();
        if resources.ended {
            drop(resources);
            stream.stop();
            return Err(CallError::Cancelled);
        }
        resources.stream = Some(stream);
        Ok(())
    }

    async fn install_negotiator(&self, negotiator: Arc<Negotiator>) -> Result<(), CallError> {
        {
            let mut resources = self.lock();
            if !resources.ended {
                resources.negotiator = Some(negotiator);
                return Ok(());
            }
        }
        negotiator.close().await;
        Err(CallError::Cancelled)
    }

    /// Remember the call id. A caller that was hung up while the offer was
    /// being published deletes the record straight away.
    async fn record_call_id(&self, call_id: CallId) -> Result<(), CallError> {
        {
            let mut resources = self.lock();
            if !resources.ended {
                resources.call_id = Some(call_id);
                return Ok(());
            }
        }
        if self.role.owns_record() {
            info!(call_id = %call_id, "Offer published after hang-up, removing it");
            self.teardown(&call_id).await;
        }
        Err(CallError::Cancelled)
    }

    fn spawn<F>(&self, task: F) -> Result<(), CallError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut resources = self.lock();
        if resources.ended {
            return Err(CallError::Cancelled);
        }
        resources.tasks.push(tokio::spawn(task));
        Ok(())
    }

    async fn teardown(&self, call_id: &CallId) {
        if let Err(e) = self.channel.teardown(call_id).await {
            warn!(call_id = %call_id, error = %e, "Could not remove call record");
        }
    }

    /// End the call: stop background work, close the connection, release
    /// the devices and, for the caller, delete the call record and its
    /// candidates. Safe from any state and at any time; only the first call
    /// does anything.
    pub async fn hang_up(&self) {
        let (stream, negotiator, tasks, record) = {
            let mut resources = self.lock();
            if resources.ended {
                return;
            }
            resources.ended = true;
            let record = if self.role.owns_record() {
                resources.call_id.clone()
            } else {
                None
            };
            (
                resources.stream.take(),
                resources.negotiator.take(),
                std::mem::take(&mut resources.tasks),
                record,
            )
        };

        for task in &tasks {
            task.abort();
        }
        if let Some(negotiator) = negotiator {
            negotiator.close().await;
        }
        if let Some(stream) = stream {
            stream.stop();
        }
        if let Some(call_id) = &record {
            self.teardown(call_id).await;
        }

        let call_id = self.call_id().map(|c| c.0).unwrap_or_default();
        info!(role = ?self.role, call_id = %call_id, "Call ended");
        self.emit(CallEvent::Ended);
    }

    /// Report a fatal error once and run the hang-up path.
    async fn fail(&self, error: CallError) {
        if error == CallError::Cancelled || self.is_ended() {
            return;
        }
        if !self.failed.swap(true, Ordering::SeqCst) {
            error!(role = ?self.role, error = %error, "Call failed");
            self.emit(CallEvent::Failed { error });
        }
        self.hang_up().await;
    }

    async fn settle<T>(&self, result: Result<T, CallError>) -> Result<T, CallError> {
        if let Err(error) = &result {
            self.fail(error.clone()).await;
        }
        result
    }

    /// Acquire devices and a negotiator with local media attached.
    async fn prepare(
        self: &Arc<Self>,
        ctx: &SessionContext,
    ) -> Result<(Arc<Negotiator>, NegotiatorEvents, Arc<LocalStream>), CallError> {
        self.ensure_live()?;
        let stream = Arc::new(ctx.devices.open(self.call_type).await?);
        self.install_stream(stream.clone())?;

        let ice_servers = resolve_ice_servers(&ctx.stun_urls, ctx.relay.as_deref()).await;
        self.ensure_live()?;
        let (transport, peer_events) = ctx.transports.connect(&ice_servers).await?;
        let (negotiator, events) = Negotiator::new(transport, peer_events);
        self.install_negotiator(negotiator.clone()).await?;

        negotiator.attach_local_media(&stream).await?;
        Ok((negotiator, events, stream))
    }

    pub(crate) async fn start(self: &Arc<Self>, ctx: &SessionContext) -> Result<CallId, CallError> {
        let result = self.run_caller(ctx).await;
        self.settle(result).await
    }

    async fn run_caller(self: &Arc<Self>, ctx: &SessionContext) -> Result<CallId, CallError> {
        let (negotiator, events, stream) = self.prepare(ctx).await?;

        let offer = negotiator.create_offer().await?;
        self.ensure_live()?;
        let call_id = self.channel.publish_offer(&offer, self.call_type).await?;
        self.record_call_id(call_id.clone()).await?;
        info!(call_id = %call_id, call_type = %self.call_type, "Call started");

        // Candidates gathered since the offer wait in the event channel.
        let weak = Arc::downgrade(self);
        self.spawn(pump_events(weak.clone(), events, call_id.clone()))?;

        let remote = self
            .channel
            .watch_remote_candidates(&call_id, self.role)
            .await?;
        self.spawn(apply_remote_candidates(negotiator.clone(), remote))?;

        let answer = self.channel.watch_answer(&call_id).await?;
        self.spawn(await_answer(weak.clone(), negotiator, answer, ctx.timeouts))?;

        if let Some(speaking) = stream.speaking() {
            self.spawn(report_speaking(weak, speaking))?;
        }
        Ok(call_id)
    }

    pub(crate) async fn join(
        self: &Arc<Self>,
        ctx: &SessionContext,
        call_id: &CallId,
    ) -> Result<(), CallError> {
        let result = self.run_callee(ctx, call_id).await;
        self.settle(result).await
    }

    async fn run_callee(
        self: &Arc<Self>,
        ctx: &SessionContext,
        call_id: &CallId,
    ) -> Result<(), CallError> {
        self.record_call_id(call_id.clone()).await?;
        let (negotiator, events, stream) = self.prepare(ctx).await?;

        let record = self.channel.fetch_call(call_id).await?;
        if record.is_answered() {
            return Err(CallError::AlreadyAnswered(call_id.clone()));
        }
        if record.call_type != self.call_type {
            debug!(
                call_id = %call_id,
                offered = %record.call_type,
                joining = %self.call_type,
                "Joining with a different call type"
            );
        }
        self.ensure_live()?;

        let answer = negotiator.create_answer(&record.offer).await?;
        self.ensure_live()?;
        self.channel.fetch_and_answer(call_id, &answer).await?;
        info!(call_id = %call_id, caller = %record.caller_id.short(), "Call joined");

        let weak = Arc::downgrade(self);
        let removal = self.channel.watch_removal(call_id).await?;
        self.spawn(note_record_removed(weak.clone(), removal))?;
        self.spawn(pump_events(weak.clone(), events, call_id.clone()))?;

        let remote = self
            .channel
            .watch_remote_candidates(call_id, self.role)
            .await?;
        self.spawn(apply_remote_candidates(negotiator.clone(), remote))?;
        self.spawn(await_connected(weak.clone(), negotiator, ctx.timeouts.connect))?;

        if let Some(speaking) = stream.speaking() {
            self.spawn(report_speaking(weak, speaking))?;
        }
        Ok(())
    }
}

/// Run the hang-up path outside the failing task, which hang-up aborts.
fn fail_detached(session: &Weak<CallSession>, error: CallError) {
    if let Some(session) = session.upgrade() {
        tokio::spawn(async move { session.fail(error).await });
    }
}

async fn pump_events(session: Weak<CallSession>, mut events: NegotiatorEvents, call_id: CallId) {
    while let Some(event) = events.next().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.is_ended() {
            break;
        }
        match event {
            NegotiatorEvent::LocalCandidate(_) if session.is_record_removed() => {
                debug!(call_id = %call_id, "Call record gone, local candidate dropped");
            }
            NegotiatorEvent::LocalCandidate(candidate) => {
                if let Err(e) = session
                    .channel
                    .publish_local_candidate(&call_id, session.role, &candidate)
                    .await
                {
                    warn!(call_id = %call_id, error = %e, "Could not publish local candidate");
                }
            }
            NegotiatorEvent::RemoteStream { stream_id } => {
                info!(call_id = %call_id, stream = %stream_id, "Remote stream available");
                session.emit(CallEvent::RemoteStream { stream_id });
            }
            NegotiatorEvent::ConnectionState(state) => {
                session.emit(CallEvent::ConnectionState(state));
            }
        }
    }
}

async fn note_record_removed(session: Weak<CallSession>, mut removal: RemovalWatch) {
    if removal.removed().await {
        if let Some(session) = session.upgrade() {
            info!("Caller removed the call record");
            session.record_removed.store(true, Ordering::SeqCst);
        }
    }
}

async fn apply_remote_candidates(negotiator: Arc<Negotiator>, mut remote: CandidateWatch) {
    while let Some(item) = remote.next().await {
        let candidate = match item {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "Skipping malformed remote candidate");
                continue;
            }
        };
        match negotiator.add_remote_candidate(candidate).await {
            Ok(CandidateDisposition::Discarded) => break,
            Ok(disposition) => debug!(?disposition, "Remote candidate received"),
            Err(e) => warn!(error = %e, "Remote candidate rejected"),
        }
    }
    debug!("Remote candidate watch ended");
}

async fn await_answer(
    session: Weak<CallSession>,
    negotiator: Arc<Negotiator>,
    mut watch: AnswerWatch,
    timeouts: CallTimeouts,
) {
    let answer = match tokio::time::timeout(timeouts.answer, watch.next()).await {
        Ok(Some(Ok(answer))) => answer,
        Ok(Some(Err(e))) => return fail_detached(&session, e.into()),
        Ok(None) => {
            return fail_detached(
                &session,
                CallError::StoreUnavailable("answer watch ended".into()),
            )
        }
        Err(_) => {
            warn!(limit = ?timeouts.answer, "No answer in time");
            return fail_detached(&session, CallError::ConnectionTimeout);
        }
    };

    match accept_and_connect(&negotiator, &answer, timeouts.connect).await {
        Ok(()) => watch_connection(session, negotiator).await,
        Err(error) => fail_detached(&session, error),
    }
}

async fn accept_and_connect(
    negotiator: &Negotiator,
    answer: &SessionDescription,
    connect: Duration,
) -> Result<(), CallError> {
    negotiator.accept_answer(answer).await?;
    negotiator.wait_connected(connect).await?;
    info!("Call connected");
    Ok(())
}

async fn await_connected(session: Weak<CallSession>, negotiator: Arc<Negotiator>, connect: Duration) {
    match negotiator.wait_connected(connect).await {
        Ok(()) => {
            info!("Call connected");
            watch_connection(session, negotiator).await;
        }
        Err(e) => fail_detached(&session, e.into()),
    }
}

/// After connecting, `disconnected` may recover on its own; `failed` ends the call.
async fn watch_connection(session: Weak<CallSession>, negotiator: Arc<Negotiator>) {
    let mut state = negotiator.subscribe_state();
    loop {
        let current = *state.borrow_and_update();
        match current {
            PeerConnectionState::Failed => {
                warn!("Connection lost");
                return fail_detached(&session, NegotiationError::ConnectionFailed.into());
            }
            PeerConnectionState::Closed => return,
            _ => {}
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn report_speaking(session: Weak<CallSession>, mut speaking: watch::Receiver<bool>) {
    while speaking.changed().await.is_ok() {
        let now = *speaking.borrow_and_update();
        let Some(session) = session.upgrade() else {
            break;
        };
        session.emit(CallEvent::Speaking(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dari_media::{SimulatedNetwork, SyntheticDevices};
    use dari_shared::UserId;
    use dari_store::SqliteMailbox;

    fn context(devices: Arc<SyntheticDevices>, network: &SimulatedNetwork) -> SessionContext {
        SessionContext {
            devices,
            transports: Arc::new(network.clone()),
            stun_urls: vec!["stun:stun.example:3478".into()],
            relay: None,
            timeouts: CallTimeouts::default(),
        }
    }

    #[tokio::test]
    async fn test_hang_up_before_setup_cancels_everything() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let channel = MailboxChannel::new(store.clone(), Some(UserId::new("alice")));
        let (events, mut rx) = broadcast::channel(16);
        let devices = Arc::new(SyntheticDevices::new());
        let network = SimulatedNetwork::new();

        let session = CallSession::new(Role::Caller, CallType::Audio, channel, events);
        session.hang_up().await;
        session.hang_up().await;
        assert_eq!(rx.recv().await.unwrap(), CallEvent::Ended);
        assert!(rx.try_recv().is_err());

        let result = session.start(&context(devices.clone(), &network)).await;
        assert_eq!(result, Err(CallError::Cancelled));
        assert_eq!(devices.open_count(), 0);
        assert!(network.peers().is_empty());
        assert!(session.toggle_mute().is_err());
        assert_eq!(session.connection_state(), PeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_started_session_exposes_local_controls() {
        let store = Arc::new(SqliteMailbox::open_in_memory().unwrap());
        let channel = MailboxChannel::new(store, Some(UserId::new("alice")));
        let (events, _rx) = broadcast::channel(16);
        let devices = Arc::new(SyntheticDevices::new());
        let network = SimulatedNetwork::new();

        let session = CallSession::new(Role::Caller, CallType::Video, channel, events);
        let call_id = session.start(&context(devices.clone(), &network)).await.unwrap();
        assert_eq!(session.call_id(), Some(call_id));
        assert!(!session.is_muted());
        assert!(session.toggle_mute().unwrap());
        assert!(session.is_muted());
        assert!(!session.toggle_camera().unwrap());
        assert!(!session.is_camera_enabled());
        assert_eq!(devices.live_leases(), 2);

        session.hang_up().await;
        assert_eq!(devices.live_leases(), 0);
        assert_eq!(network.peers()[0].connection_state(), PeerConnectionState::Closed);
    }
}
