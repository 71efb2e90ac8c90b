//! Storage collaborator contract.

use crate::enrollment::Role;
use crate::types::{Embedding, IdentityId, IdentityRecord};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("malformed encoding for identity {id}: {reason}")]
    MalformedEncoding { id: String, reason: String },
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("query failed: {0}")]
    Query(String),
}

/// A validated enrollment, ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub display_name: String,
    pub roll_number: String,
    pub department: String,
    pub role: Role,
    pub encoding: Embedding,
}

/// Durable home of identities and attendance rows.
///
/// `list_identities` must return records in a stable order; that order is the
/// snapshot order the matcher uses to break distance ties.
pub trait IdentityStore: Send + Sync {
    fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    fn insert_identity(&self, identity: &NewIdentity) -> Result<IdentityId, StoreError>;

    /// Delete an identity and its attendance rows. Returns false if it did not exist.
    fn remove_identity(&self, id: &IdentityId) -> Result<bool, StoreError>;

    fn insert_attendance(&self, id: &IdentityId, at: DateTime<Utc>) -> Result<(), StoreError>;
}
