//! fanout relay library
//!
//! A WebRTC media relay: live transports (ICE, DTLS, SRTP) and file or
//! synthetic endpoints publish into routers that fan media out to any number
//! of subscribers, transcoding where codecs differ. Exposed as a library for
//! embedding in a host application and for tests.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod relay;
pub mod router;
pub mod transport;

pub use config::RelayConfig;
pub use connection::{Connection, ConnectionKind};
pub use error::{RelayError, Result};
pub use relay::{Relay, RelayBuilder};
