//! # dari-call
//!
//! Places a two-party call between two sessions in this process, over the
//! configured mailbox and real WebRTC peer connections. The caller uses the
//! host devices; the callee uses synthetic ones.
//!
//! Usage: `dari-call [audio|video] [seconds]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dari_client::{
    spawn_sweeper, CallController, CallEvent, ClientConfig, HttpRelayCredentials,
};
use dari_media::{
    MailboxChannel, PeerConnectionState, SyntheticDevices, TransportFactory, WebRtcFactory,
};
use dari_shared::{CallType, UserId};
use dari_store::DocumentStore;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

async fn until_connected(mut events: broadcast::Receiver<CallEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(CallEvent::ConnectionState(PeerConnectionState::Connected)) => return Ok(()),
            Ok(CallEvent::Failed { error }) => anyhow::bail!(error.user_message()),
            Ok(CallEvent::Ended) => anyhow::bail!("call ended before connecting"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("event channel closed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    dari_client::init_tracing();
    info!("Starting dari-call v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let mut args = std::env::args().skip(1);
    let call_type: CallType = match args.next() {
        Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
        None => CallType::Audio,
    };
    let hold = match args.next() {
        Some(raw) => Duration::from_secs(raw.parse().context("seconds must be a number")?),
        None => Duration::from_secs(5),
    };

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let mailbox: Arc<dyn DocumentStore> =
        Arc::new(config.open_mailbox().context("opening the mailbox")?);
    let transports: Arc<dyn TransportFactory> = Arc::new(WebRtcFactory::new()?);

    let caller_id = config
        .user_id
        .clone()
        .unwrap_or_else(|| UserId::new("dari-caller"));
    let caller_channel =
        MailboxChannel::new(mailbox.clone(), Some(caller_id)).with_retry(config.retry_policy());
    let callee_channel = MailboxChannel::new(mailbox.clone(), Some(UserId::new("dari-callee")))
        .with_retry(config.retry_policy());

    let mut caller = CallController::new(
        caller_channel.clone(),
        Arc::new(config.host_devices()),
        transports.clone(),
    )
    .with_stun_urls(config.stun_urls.clone())
    .with_timeouts(config.timeouts());
    let mut callee = CallController::new(
        callee_channel,
        Arc::new(SyntheticDevices::new()),
        transports,
    )
    .with_stun_urls(config.stun_urls.clone())
    .with_timeouts(config.timeouts());

    if let Some(url) = &config.relay_credentials_url {
        let relay = Arc::new(HttpRelayCredentials::new(url.clone())?);
        caller = caller.with_relay(relay.clone());
        callee = callee.with_relay(relay);
    }

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let sweeper = spawn_sweeper(caller_channel, config.stale_call_ttl, config.sweep_interval);

    // -----------------------------------------------------------------------
    // 5. Place the call
    // -----------------------------------------------------------------------
    let caller_events = caller.subscribe();
    let callee_events = callee.subscribe();

    let call_id = match caller.start_call(call_type).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "{}", e.user_message());
            sweeper.abort();
            return Err(e.into());
        }
    };
    info!(call_id = %call_id, %call_type, "Share this call id with the other party");

    if let Err(e) = callee.join_call(&call_id, call_type).await {
        error!(error = %e, "{}", e.user_message());
        caller.hang_up().await;
        sweeper.abort();
        return Err(e.into());
    }

    // -----------------------------------------------------------------------
    // 6. Hold the call, then hang up
    // -----------------------------------------------------------------------
    let connected = tokio::select! {
        result = async {
            tokio::try_join!(until_connected(caller_events), until_connected(callee_events))
        } => Some(result.map(|_| ())),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, hanging up");
            None
        }
    };

    match &connected {
        Some(Ok(())) => {
            info!(seconds = hold.as_secs(), "Call connected");
            tokio::select! {
                _ = tokio::time::sleep(hold) => {}
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, hanging up"),
            }
        }
        Some(Err(e)) => warn!(error = %e, "Call did not connect"),
        None => {}
    }

    callee.hang_up().await;
    caller.hang_up().await;
    sweeper.abort();

    connected.unwrap_or(Ok(()))
}
