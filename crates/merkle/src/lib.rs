//! Versioned sparse Merkle tree over a content-addressed fact store.
//!
//! This crate provides:
//! - Content-addressed persistence of tree nodes ("facts") with an LRU
//!   read cache
//! - Copy-on-write tree updates: a new root is produced from an old root
//!   plus a batch of index/value modifications, sharing all untouched
//!   subtrees with the previous version
//! - Precomputed empty-subtree roots, so unreferenced subtrees resolve
//!   without storage reads

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};
use storage::{Storage, StorageError};
use thiserror::Error;
use tracing::debug;

/// A 32-byte hash value.
pub type Hash32 = [u8; 32];

/// Default capacity of the node-fact cache, in entries.
pub const DEFAULT_FACT_CACHE_SIZE: usize = 65536;

/// Errors that can occur during tree operations.
#[derive(Error, Debug)]
pub enum MerkleError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("missing fact for node {0}")]
    MissingFact(String),
    #[error("malformed node fact under {hash}: {len} bytes")]
    MalformedFact { hash: String, len: usize },
    #[error("index {index} out of range for tree of height {height}")]
    InvalidIndex { index: u64, height: usize },
}

/// Hash arbitrary fact content to its storage key.
pub fn hash_content(content: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.finalize().into()
}

/// Hash two child hashes to produce the parent hash.
pub fn hash_nodes(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn node_content(left: &Hash32, right: &Hash32) -> Vec<u8> {
    let mut content = Vec::with_capacity(64);
    content.extend_from_slice(left);
    content.extend_from_slice(right);
    content
}

/// Storage key for a fact: `fact:<hex-hash>`.
pub fn fact_key(hash: &Hash32) -> Vec<u8> {
    let mut key = b"fact:".to_vec();
    key.extend_from_slice(hex::encode(hash).as_bytes());
    key
}

/// Precomputed roots of empty subtrees, one per height.
///
/// `root(0)` is the hash of the profile's empty leaf content; `root(h)` is
/// the root of a height-`h` tree whose leaves are all empty.
#[derive(Debug, Clone)]
pub struct EmptySubtreeRoots {
    roots: Vec<Hash32>,
}

impl EmptySubtreeRoots {
    pub fn new(empty_leaf_content: &[u8], max_height: usize) -> Self {
        let mut roots = Vec::with_capacity(max_height + 1);
        roots.push(hash_content(empty_leaf_content));
        for h in 1..=max_height {
            roots.push(hash_nodes(&roots[h - 1], &roots[h - 1]));
        }
        Self { roots }
    }

    /// Root of the empty subtree at the given height.
    pub fn root(&self, height: usize) -> Hash32 {
        self.roots[height]
    }

    pub fn max_height(&self) -> usize {
        self.roots.len() - 1
    }
}

/// Content-addressed store of Merkle facts.
///
/// Leaf facts hold the serialized leaf value; internal node facts hold the
/// concatenation of the two child hashes. Facts are write-once: the key is
/// the hash of the content, so rewrites are idempotent and two trees
/// touching the same subtree share physical storage.
pub struct FactStore<S> {
    storage: S,
    node_cache: Mutex<LruCache<Hash32, (Hash32, Hash32)>>,
}

impl<S: Storage> FactStore<S> {
    pub fn new(storage: S, cache_size: usize) -> Self {
        let capacity =
            NonZeroUsize::new(cache_size.max(1)).expect("cache capacity is non-zero");
        Self {
            storage,
            node_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Writes a batch of facts in one storage call; durable before return.
    pub async fn put_facts(
        &self,
        facts: HashMap<Hash32, Vec<u8>>,
    ) -> Result<(), MerkleError> {
        if facts.is_empty() {
            return Ok(());
        }
        let entries: HashMap<Vec<u8>, Vec<u8>> = facts
            .iter()
            .map(|(hash, content)| (fact_key(hash), content.clone()))
            .collect();
        self.storage.multi_set(entries).await?;

        // Facts are immutable, so the cache never needs invalidation.
        let mut cache = self.node_cache.lock().expect("cache lock poisoned");
        for (hash, content) in &facts {
            if let Some(children) = split_node_content(content) {
                cache.put(*hash, children);
            }
        }
        Ok(())
    }

    /// Looks up an internal node fact, returning its child hashes.
    pub async fn get_node(&self, hash: &Hash32) -> Result<(Hash32, Hash32), MerkleError> {
        if let Some(children) = self
            .node_cache
            .lock()
            .expect("cache lock poisoned")
            .get(hash)
        {
            return Ok(*children);
        }
        let content = self
            .storage
            .get(&fact_key(hash))
            .await?
            .ok_or_else(|| MerkleError::MissingFact(hex::encode(hash)))?;
        let children = split_node_content(&content).ok_or_else(|| MerkleError::MalformedFact {
            hash: hex::encode(hash),
            len: content.len(),
        })?;
        self.node_cache
            .lock()
            .expect("cache lock poisoned")
            .put(*hash, children);
        Ok(children)
    }

    /// Batched lookup of internal node facts. Every requested hash must be
    /// present; a gap means the store lost data reachable from a persisted
    /// root.
    pub async fn multi_get_nodes(
        &self,
        hashes: &[Hash32],
    ) -> Result<HashMap<Hash32, (Hash32, Hash32)>, MerkleError> {
        let mut found = HashMap::with_capacity(hashes.len());
        let mut misses = Vec::new();
        {
            let mut cache = self.node_cache.lock().expect("cache lock poisoned");
            for hash in hashes {
                match cache.get(hash) {
                    Some(children) => {
                        found.insert(*hash, *children);
                    }
                    None => misses.push(*hash),
                }
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let keys: Vec<Vec<u8>> = misses.iter().map(fact_key).collect();
        let fetched = self.storage.multi_get(&keys).await?;
        let mut cache = self.node_cache.lock().expect("cache lock poisoned");
        for (hash, key) in misses.iter().zip(&keys) {
            let content = fetched
                .get(key)
                .ok_or_else(|| MerkleError::MissingFact(hex::encode(hash)))?;
            let children =
                split_node_content(content).ok_or_else(|| MerkleError::MalformedFact {
                    hash: hex::encode(hash),
                    len: content.len(),
                })?;
            cache.put(*hash, children);
            found.insert(*hash, children);
        }
        Ok(found)
    }

    /// Looks up a leaf fact, returning the serialized leaf value.
    pub async fn get_leaf(&self, hash: &Hash32) -> Result<Vec<u8>, MerkleError> {
        self.storage
            .get(&fact_key(hash))
            .await?
            .ok_or_else(|| MerkleError::MissingFact(hex::encode(hash)))
    }
}

fn split_node_content(content: &[u8]) -> Option<(Hash32, Hash32)> {
    if content.len() != 64 {
        return None;
    }
    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&content[..32]);
    right.copy_from_slice(&content[32..]);
    Some((left, right))
}

/// An immutable Merkle tree of fixed height, identified by its root fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleTree {
    pub root: Hash32,
    pub height: usize,
}

impl MerkleTree {
    /// The empty tree of the given height; no facts are written.
    pub fn empty(height: usize, empty: &EmptySubtreeRoots) -> Self {
        Self {
            root: empty.root(height),
            height,
        }
    }

    fn capacity(&self) -> u128 {
        1u128 << self.height
    }

    /// Applies a batch of `(index, leaf_content)` modifications, writing all
    /// new facts in one batched storage call, and returns the new tree along
    /// with the number of facts written.
    ///
    /// Later entries overwrite earlier ones at the same index. Untouched
    /// subtrees keep their existing hashes and are never read.
    pub async fn update<S: Storage>(
        &self,
        store: &FactStore<S>,
        empty: &EmptySubtreeRoots,
        updates: &[(u64, Vec<u8>)],
    ) -> Result<(MerkleTree, usize), MerkleError> {
        for (index, _) in updates {
            if (*index as u128) >= self.capacity() {
                return Err(MerkleError::InvalidIndex {
                    index: *index,
                    height: self.height,
                });
            }
        }
        if updates.is_empty() {
            return Ok((*self, 0));
        }

        // Deduplicate by index, last write wins, then sort by index.
        let deduped: std::collections::BTreeMap<u64, &Vec<u8>> =
            updates.iter().map(|(i, v)| (*i, v)).collect();
        let modifications: Vec<(u64, &Vec<u8>)> = deduped.into_iter().collect();

        let nodes = self.prefetch(store, empty, &modifications).await?;

        let mut new_facts = HashMap::new();
        let new_root = compute_updated_node(
            self.root,
            self.height,
            0,
            &modifications,
            &nodes,
            empty,
            &mut new_facts,
        )?;
        let fact_count = new_facts.len();
        store.put_facts(new_facts).await?;

        debug!(
            height = self.height,
            modifications = modifications.len(),
            facts = fact_count,
            "tree updated"
        );
        Ok((
            MerkleTree {
                root: new_root,
                height: self.height,
            },
            fact_count,
        ))
    }

    /// Level-by-level descent collecting the internal facts of every
    /// touched, non-empty node; one batched read per level.
    async fn prefetch<S: Storage>(
        &self,
        store: &FactStore<S>,
        empty: &EmptySubtreeRoots,
        modifications: &[(u64, &Vec<u8>)],
    ) -> Result<HashMap<Hash32, (Hash32, Hash32)>, MerkleError> {
        struct Pending<'a> {
            hash: Hash32,
            lo: u128,
            updates: &'a [(u64, &'a Vec<u8>)],
        }

        let mut nodes = HashMap::new();
        let mut frontier = Vec::new();
        if self.height > 0 && self.root != empty.root(self.height) {
            frontier.push(Pending {
                hash: self.root,
                lo: 0,
                updates: modifications,
            });
        }

        let mut height = self.height;
        while !frontier.is_empty() && height > 0 {
            let hashes: Vec<Hash32> = frontier.iter().map(|p| p.hash).collect();
            let fetched = store.multi_get_nodes(&hashes).await?;
            nodes.extend(&fetched);

            let child_height = height - 1;
            let mut next = Vec::new();
            for pending in frontier {
                let (left, right) = fetched[&pending.hash];
                let mid = pending.lo + (1u128 << child_height);
                let split = pending
                    .updates
                    .partition_point(|(index, _)| (*index as u128) < mid);
                let (left_updates, right_updates) = pending.updates.split_at(split);
                for (hash, lo, updates) in [
                    (left, pending.lo, left_updates),
                    (right, mid, right_updates),
                ] {
                    if !updates.is_empty()
                        && child_height > 0
                        && hash != empty.root(child_height)
                    {
                        next.push(Pending { hash, lo, updates });
                    }
                }
            }
            frontier = next;
            height = child_height;
        }
        Ok(nodes)
    }
}

/// Pure recomputation of the subtree rooted at `node_hash` over the index
/// range `[lo, lo + 2^height)`. Every prior node on a touched path must be
/// present in `nodes`; new facts are collected into `new_facts`.
fn compute_updated_node(
    node_hash: Hash32,
    height: usize,
    lo: u128,
    updates: &[(u64, &Vec<u8>)],
    nodes: &HashMap<Hash32, (Hash32, Hash32)>,
    empty: &EmptySubtreeRoots,
    new_facts: &mut HashMap<Hash32, Vec<u8>>,
) -> Result<Hash32, MerkleError> {
    if updates.is_empty() {
        return Ok(node_hash);
    }
    if height == 0 {
        // Deduplication guarantees a single modification per leaf.
        let content = updates[0].1;
        let leaf_hash = hash_content(content);
        new_facts.insert(leaf_hash, content.to_vec());
        return Ok(leaf_hash);
    }

    let (left, right) = if node_hash == empty.root(height) {
        (empty.root(height - 1), empty.root(height - 1))
    } else {
        *nodes
            .get(&node_hash)
            .ok_or_else(|| MerkleError::MissingFact(hex::encode(node_hash)))?
    };

    let mid = lo + (1u128 << (height - 1));
    let split = updates.partition_point(|(index, _)| (*index as u128) < mid);
    let (left_updates, right_updates) = updates.split_at(split);

    let new_left =
        compute_updated_node(left, height - 1, lo, left_updates, nodes, empty, new_facts)?;
    let new_right =
        compute_updated_node(right, height - 1, mid, right_updates, nodes, empty, new_facts)?;

    let parent = hash_nodes(&new_left, &new_right);
    new_facts.insert(parent, node_content(&new_left, &new_right));
    Ok(parent)
}
