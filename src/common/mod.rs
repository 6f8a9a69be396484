//! Common utilities and types

pub mod crypto;
pub mod error;
pub mod metadata;
pub mod net;

pub use crypto::Credentials;
pub use error::{Error, Result};
pub use metadata::{Destination, Metadata, Network, ProtocolKind};
