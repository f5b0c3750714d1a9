//! Concrete connector implementations, one per [`crate::types::StoreKind`].
//!
//! Each connector owns exactly one physical connection/session and keeps its
//! store-specific logic isolated so it can be tested on its own.

mod embedded;
mod hosted;
mod mock;

pub use embedded::EmbeddedConnector;
pub use hosted::HostedConnector;
pub use mock::MockConnector;
