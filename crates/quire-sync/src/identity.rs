//! Who the local user is.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The local user as announced in the handshake and in awareness state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub client_id: String,
    pub display_name: String,
}

impl Identity {
    /// An identity with a freshly generated client id.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            client_id: Ulid::new().to_string(),
            display_name: display_name.into(),
        }
    }

    pub fn with_client_id(client_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Source of the local identity. Authentication lives behind this trait.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn identify(&self) -> Result<Identity>;
}

/// Always answers with the same identity.
#[derive(Clone, Debug)]
pub struct StaticIdentity(pub Identity);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn identify(&self) -> Result<Identity> {
        Ok(self.0.clone())
    }
}
