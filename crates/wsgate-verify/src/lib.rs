//! wsgate-verify — confirms a deployed stage accepts streaming connections.
//!
//! - **`transport`**: the `StreamTransport` / `StreamConnection` seam and a
//!   tokio-tungstenite implementation with rustls
//! - **`verifier`**: bounded retry loop sending one probe frame and
//!   asserting on the reply

pub mod transport;
pub mod verifier;

pub use transport::{
    StreamConnection, StreamTransport, TransportConfig, TransportError, TransportResult,
    TungsteniteTransport,
};
pub use verifier::{
    ConnectionVerifier, ExpectedMarker, Probe, VerifyConfig, VerifyError, VerifyReport,
    VerifyResult,
};
