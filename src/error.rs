//! Crate-wide error taxonomy.
//!
//! Kept narrow on purpose: most Byzantine/network failure modes in the
//! source (invalid JSON, connection refused, timeouts) are handled
//! in-place by logging and dropping the offending message rather than
//! propagating an error, matching `Network._process_client_data`'s
//! `try/except` style. `CoreError` covers the failures that should stop
//! a node or a whole run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to bind listener on {addr} after retries: {source}")]
    ListenerBindExhausted {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key material: {0}")]
    KeyDecode(#[from] crate::crypto::CryptoError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to deliver message to node task: {0}")]
    ChannelSend(String),
}
