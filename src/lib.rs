//! threadstr: a local-first engine for Nostr comment threads.
//!
//! Reconciles signed events arriving from multiple unreliable relays into a
//! canonical reply tree and deduplicated reaction totals, anchored to a web
//! page URL, a note, or an addressable long-form document. Rendering, key
//! management and markdown are the host's concern; the engine exposes
//! watch channels over a persistent local store and delegates signing to
//! an injected [`NostrSigner`] capability.

pub use crate::aggregation::{LikeVote, ZapReceipt, invoice_amount_sats};
pub use crate::anchor::Anchor;
pub use crate::error::{Result, ThreadstrError};
pub use crate::store::{
    AggregateRecord, LocalStore, NoteKind, NoteRecord, PROFILE_STALE_AFTER_SECS, ProfileRecord,
    StoreFamily, SyncCursor, VoteState,
};
pub use crate::sync::{SyncError, ThreadSession};
pub use crate::threading::{
    NestedNote, SiblingOrder, flatten, nest, nest_under, prune_childless_highlights,
};
pub use crate::types::{
    AggregateSnapshot, AttachOptions, DEFAULT_RELAYS, DisabledFeature, PublishReport,
    ReactionKind, SyncStatus, parse_disabled_features,
};

use anyhow::Context;
use nostr_sdk::prelude::*;
use ::rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod aggregation;
mod anchor;
mod error;
mod normalizer;
mod store;
mod sync;
mod threading;
mod types;

use crate::store::Database;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let stdout_layer = Layer::new().with_ansi(true).with_target(true);
        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .init();
    });
}

#[derive(Clone, Debug)]
pub struct ThreadstrConfig {
    /// Directory for the persistent store. `None` degrades to an
    /// in-memory store with identical semantics.
    pub data_dir: Option<PathBuf>,

    /// Relays used by sessions that don't bring their own.
    pub default_relays: Vec<RelayUrl>,

    /// Keep trailing slashes significant in URL anchors, for hosts that
    /// cached threads under the old keys.
    pub legacy_url_anchors: bool,
}

impl ThreadstrConfig {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: Some(data_dir.to_path_buf()),
            ..Self::default()
        }
    }

    /// Headless/testing configuration: everything in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }
}

impl Default for ThreadstrConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_relays: DEFAULT_RELAYS
                .iter()
                .map(|url| RelayUrl::parse(url).expect("default relay urls are valid"))
                .collect(),
            legacy_url_anchors: false,
        }
    }
}

/// The engine. One instance owns the local store and the relay pool;
/// per-anchor work happens in [`ThreadSession`]s created by [`attach`].
///
/// [`attach`]: Threadstr::attach
pub struct Threadstr {
    pub config: ThreadstrConfig,
    store: Arc<LocalStore>,
    client: Client,
    session_salt: [u8; 16],
}

impl Threadstr {
    /// Initializes the engine: tracing, the local store (persistent when a
    /// data dir is configured, in-memory otherwise) and the relay client.
    pub async fn initialize(config: ThreadstrConfig) -> Result<Self> {
        init_tracing();

        let database = match &config.data_dir {
            Some(data_dir) => {
                std::fs::create_dir_all(data_dir)
                    .with_context(|| format!("Failed to create data directory: {data_dir:?}"))?;
                Database::new(data_dir.join("threadstr.sqlite")).await?
            }
            None => {
                tracing::debug!(
                    target: "threadstr::initialize",
                    "no data directory configured, using the in-memory store"
                );
                Database::new_in_memory().await?
            }
        };
        let store = Arc::new(LocalStore::new(database));
        let client = Client::default();

        let mut session_salt = [0u8; 16];
        ::rand::rng().fill_bytes(&mut session_salt);

        Ok(Self {
            config,
            store,
            client,
            session_salt,
        })
    }

    /// Resolves a host-supplied reference into an anchor. Never fails;
    /// undecodable input yields [`Anchor::Malformed`] for rendering.
    pub fn resolve_anchor(&self, reference: &str) -> Anchor {
        Anchor::parse(reference, self.config.legacy_url_anchors)
    }

    /// Attaches to a discussion: resolves the anchor, discovers its roots,
    /// and starts syncing against the relay set. Sessions are independent;
    /// re-anchoring means closing the old session and attaching a new one.
    pub async fn attach(&self, reference: &str, options: AttachOptions) -> Result<ThreadSession> {
        let anchor = self.resolve_anchor(reference);
        if let Anchor::Malformed(diagnostic) = &anchor {
            return Err(ThreadstrError::MalformedAnchor(diagnostic.clone()));
        }
        sync::start_session(
            self.client.clone(),
            self.store.clone(),
            anchor,
            options,
            &self.config.default_relays,
            &self.session_salt,
        )
        .await
    }

    /// Direct read access to the local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Wipes all persisted families.
    pub async fn clear_cache(&self) -> Result<()> {
        self.store.clear().await?;
        Ok(())
    }
}
