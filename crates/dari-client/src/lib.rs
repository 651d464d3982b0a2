//! # dari-client
//!
//! The call session controller and everything around it a UI needs: the
//! error taxonomy with user-facing messages, call events, relay
//! credentials, configuration, and the stale-call sweeper.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod relay;
pub mod session;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use config::ClientConfig;
pub use controller::CallController;
pub use error::{CallError, Resource};
pub use events::CallEvent;
pub use relay::{resolve_ice_servers, HttpRelayCredentials, RelayCredentialSource, RelayError};
pub use session::{CallSession, CallTimeouts};
pub use sweep::spawn_sweeper;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Call once, at startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("dari_client=debug,dari_media=info,dari_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
