use nostr_sdk::prelude::*;
use thiserror::Error;

use crate::store::database::DatabaseError;
use crate::sync::SyncError;

pub type Result<T> = core::result::Result<T, ThreadstrError>;

#[derive(Error, Debug)]
pub enum ThreadstrError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Malformed anchor: {0}")]
    MalformedAnchor(String),

    #[error("No relays available")]
    NoRelaysAvailable,

    #[error("Publishing is disabled for this session")]
    PublishDisabled,

    #[error("Signer mismatch: session is bound to {expected}, signer provided {provided}")]
    SignerMismatch {
        expected: PublicKey,
        provided: PublicKey,
    },

    #[error("Publish failed on all {} relays", failed.len())]
    PublishFailed {
        /// The signed event, preserved so the caller can retry without recomposing.
        event: Box<Event>,
        failed: Vec<RelayUrl>,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Nostr client error: {0}")]
    NostrClient(#[from] nostr_sdk::client::Error),

    #[error("Nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::key::Error),

    #[error("Signer error: {0}")]
    Signer(#[from] nostr_sdk::signer::SignerError),

    #[error("Nostr event error: {0}")]
    NostrEventBuilder(#[from] nostr_sdk::event::builder::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
