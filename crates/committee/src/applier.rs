//! Batch applier: reconstructs the post-batch Merkle state and verifies it
//! against the operator-declared roots.

use std::collections::BTreeMap;

use merkle::{EmptySubtreeRoots, FactStore, Hash32, MerkleError, MerkleTree};
use state::{Profile, StateUpdate};
use storage::Storage;
use thiserror::Error;
use tracing::info;

/// Errors raised while applying a batch. All of them are fatal for the
/// batch: nothing is signed and nothing becomes the current head.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error("{tree} root mismatch: operator declared {declared}, computed {computed}")]
    RootMismatch {
        tree: &'static str,
        declared: String,
        computed: String,
    },
    #[error("invalid batch: {0}")]
    Validation(String),
    #[error("corrupt root record: {0}")]
    CorruptRecord(String),
}

/// The verified roots of one committed batch, one per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRoots {
    pub state_root: Hash32,
    pub order_root: Hash32,
}

impl BatchRoots {
    /// Serializes to the stored root-pointer record: a JSON map of tree
    /// name to hex root.
    pub fn to_record(&self, profile: Profile) -> Vec<u8> {
        let record = BTreeMap::from([
            (profile.state_tree_name(), hex::encode(self.state_root)),
            (profile.order_tree_name(), hex::encode(self.order_root)),
        ]);
        serde_json::to_vec(&record).expect("root record serialization is infallible")
    }

    pub fn from_record(profile: Profile, bytes: &[u8]) -> Result<Self, ApplyError> {
        let record: BTreeMap<String, String> = serde_json::from_slice(bytes)
            .map_err(|e| ApplyError::CorruptRecord(e.to_string()))?;
        let root = |name: &str| {
            let hex_root = record
                .get(name)
                .ok_or_else(|| ApplyError::CorruptRecord(format!("missing {name} root")))?;
            let bytes = hex::decode(hex_root)
                .map_err(|e| ApplyError::CorruptRecord(e.to_string()))?;
            Hash32::try_from(bytes.as_slice())
                .map_err(|_| ApplyError::CorruptRecord(format!("bad {name} root length")))
        };
        Ok(Self {
            state_root: root(profile.state_tree_name())?,
            order_root: root(profile.order_tree_name())?,
        })
    }
}

struct TreeParams {
    name: &'static str,
    height: usize,
    empty: EmptySubtreeRoots,
}

/// Applies batch deltas to the committee's trees and verifies the declared
/// roots. Persisting the root pointer is the committee loop's commit step,
/// not the applier's.
pub struct BatchApplier<S> {
    facts: FactStore<S>,
    profile: Profile,
    state_tree: TreeParams,
    order_tree: TreeParams,
    max_delta_size: usize,
}

impl<S: Storage> BatchApplier<S> {
    pub fn new(
        facts: FactStore<S>,
        profile: Profile,
        state_height: usize,
        order_height: usize,
        max_delta_size: usize,
    ) -> Self {
        Self {
            facts,
            profile,
            state_tree: TreeParams {
                name: profile.state_tree_name(),
                height: state_height,
                empty: EmptySubtreeRoots::new(&profile.empty_state_leaf(), state_height),
            },
            order_tree: TreeParams {
                name: profile.order_tree_name(),
                height: order_height,
                empty: EmptySubtreeRoots::new(&profile.empty_order_leaf(), order_height),
            },
            max_delta_size,
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn state_height(&self) -> usize {
        self.state_tree.height
    }

    pub fn order_height(&self) -> usize {
        self.order_tree.height
    }

    pub fn facts(&self) -> &FactStore<S> {
        &self.facts
    }

    /// Roots of the all-empty trees: the post-state of batch −1.
    pub fn empty_roots(&self) -> BatchRoots {
        BatchRoots {
            state_root: self.state_tree.empty.root(self.state_tree.height),
            order_root: self.order_tree.empty.root(self.order_tree.height),
        }
    }

    /// Applies one batch from its reference state and returns the computed
    /// roots, which at this point match the operator-declared ones.
    pub async fn apply(
        &self,
        update: &StateUpdate,
        reference: &BatchRoots,
    ) -> Result<BatchRoots, ApplyError> {
        if update.batch_id < 0 {
            return Err(ApplyError::Validation(format!(
                "negative batch id {}",
                update.batch_id
            )));
        }
        for (tree, len) in [
            (self.state_tree.name, update.state_delta.len()),
            (self.order_tree.name, update.order_delta.len()),
        ] {
            if len > self.max_delta_size {
                return Err(ApplyError::Validation(format!(
                    "{tree} delta has {len} entries, exceeding the {} limit",
                    self.max_delta_size
                )));
            }
        }
        if reference.state_root != update.prev_batch_root {
            return Err(ApplyError::Validation(format!(
                "declared prev root {} does not match reference batch {} root {}",
                hex::encode(update.prev_batch_root),
                update.reference_batch_id,
                hex::encode(reference.state_root),
            )));
        }

        let (new_state, state_facts) = MerkleTree {
            root: reference.state_root,
            height: self.state_tree.height,
        }
        .update(&self.facts, &self.state_tree.empty, &update.state_delta)
        .await?;

        let (new_order, order_facts) = MerkleTree {
            root: reference.order_root,
            height: self.order_tree.height,
        }
        .update(&self.facts, &self.order_tree.empty, &update.order_delta)
        .await?;

        for (tree, computed, declared) in [
            (self.state_tree.name, new_state.root, update.next_batch_root),
            (self.order_tree.name, new_order.root, update.order_root),
        ] {
            if computed != declared {
                return Err(ApplyError::RootMismatch {
                    tree,
                    declared: hex::encode(declared),
                    computed: hex::encode(computed),
                });
            }
            info!("Verified {tree} root: 0x{}", hex::encode(computed));
        }

        info!(
            batch_id = update.batch_id,
            state_facts, order_facts, "Batch state reconstructed"
        );
        Ok(BatchRoots {
            state_root: new_state.root,
            order_root: new_order.root,
        })
    }
}
