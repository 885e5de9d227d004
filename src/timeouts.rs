//! Centralized intervals and deadlines for the background tasks.

use std::time::Duration;

/// Period of the node-password secret cleanup after a cluster reset.
pub const NODE_PASSWORD_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Maximum time a client may take to complete the TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed `accept` before polling the socket again.
pub const LISTENER_ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
