/// Application name
pub const APP_NAME: &str = "Dari";

/// Top-level mailbox collection holding one document per call attempt
pub const CALLS_COLLECTION: &str = "calls";

/// Subcollection written by the caller (one document per ICE candidate)
pub const OFFER_CANDIDATES: &str = "offerCandidates";

/// Subcollection written by the callee
pub const ANSWER_CANDIDATES: &str = "answerCandidates";

/// Public reflection servers used before any relay credentials are merged in
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// How long a caller waits for the callee's answer to appear
pub const DEFAULT_ANSWER_TIMEOUT_SECS: u64 = 60;

/// How long either side waits for the peer connection to reach `connected`
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Unanswered call records older than this are swept
pub const DEFAULT_STALE_CALL_TTL_SECS: u64 = 3600;

/// Interval between two sweeps of abandoned call records
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Attempts made for a mailbox operation that fails transiently
pub const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay between two mailbox retries (doubles each attempt)
pub const DEFAULT_STORE_RETRY_BACKOFF_MS: u64 = 200;

/// Mean absolute amplitude (fraction of full scale) above which the local
/// user is considered to be speaking. 5 steps of an 8-bit sample centred on 128.
pub const SPEAKING_THRESHOLD: f32 = 5.0 / 128.0;
