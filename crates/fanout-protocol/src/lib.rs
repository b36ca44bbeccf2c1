//! Plain-data types shared between the relay core and the host application.
//!
//! Everything here is serialisable and carries no runtime object identity, so
//! a binding layer can marshal it across whatever boundary it needs.

pub mod events;
pub mod types;

pub use events::*;
pub use types::*;
