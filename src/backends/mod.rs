//! Remote secret store implementations
//!
//! The engine talks to the remote store only through [`VaultTransport`] and
//! resolves credentials only through [`CredentialProvider`].

mod memory;
mod transport;
mod vault;

pub use memory::{CallCounts, MemoryTransport};
pub use transport::{CredentialProvider, Credentials, StructuredSecret, VaultTransport};
pub use vault::VaultHttpClient;

use std::sync::Arc;

/// Type alias for a shared transport trait object
pub type Transport = Arc<dyn VaultTransport>;
