//! The committee polling loop.
//!
//! A single cooperative task that discovers new batches on the availability
//! gateway, drives the batch applier, signs availability claims and submits
//! them, and only then commits the batch locally. Reorgs rewind the cursor;
//! a root mismatch stops the node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gateway::{AvailabilityGateway, BatchPoll, GatewayError, RetryPolicy};
use merkle::FactStore;
use signer::{AttestationSigner, AvailabilityClaim, SignerError};
use state::StateUpdate;
use storage::{Storage, StorageError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::applier::{ApplyError, BatchApplier, BatchRoots};
use crate::config::CommitteeConfig;

/// Storage key of the root-pointer record for a batch.
pub fn root_record_key(batch_id: i64) -> Vec<u8> {
    format!("root:{batch_id}").into_bytes()
}

/// Storage key of the ingestion cursor.
pub fn cursor_key() -> Vec<u8> {
    b"cursor:next_id".to_vec()
}

/// Fatal committee failures; the process exits non-zero on any of these.
#[derive(Error, Debug)]
pub enum CommitteeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("corrupt cursor record: {0}")]
    CorruptCursor(String),
    #[error("gateway repeatedly rejected the signature for batch {batch_id}")]
    SubmissionRejected { batch_id: i64 },
}

/// Cooperative shutdown switch. The loop finishes its current step and
/// exits at the next cycle boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of processing one fetched batch.
enum Outcome {
    Committed,
    /// A reorg or a gap; resume ingestion from this id.
    Rewind(i64),
    /// Transient trouble; sleep and re-poll the same id.
    RetryLater,
    /// The gateway structurally rejected our signature.
    Rejected,
}

/// The committee node's ingestion and attestation engine.
pub struct Committee<S, G> {
    storage: Arc<S>,
    applier: BatchApplier<Arc<S>>,
    gateway: G,
    signer: AttestationSigner,
    polling_interval: std::time::Duration,
    submit_retry: RetryPolicy,
    stop: StopHandle,
}

impl<S: Storage, G: AvailabilityGateway> Committee<S, G> {
    pub fn new(
        config: &CommitteeConfig,
        storage: Arc<S>,
        gateway: G,
        signer: AttestationSigner,
    ) -> Self {
        let facts = FactStore::new(Arc::clone(&storage), config.fact_cache_size);
        let applier = BatchApplier::new(
            facts,
            config.profile,
            config.state_height(),
            config.order_height(),
            config.max_delta_size,
        );
        Self {
            storage,
            applier,
            gateway,
            signer,
            polling_interval: config.polling_interval(),
            submit_retry: RetryPolicy::default(),
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn applier(&self) -> &BatchApplier<Arc<S>> {
        &self.applier
    }

    /// Runs the polling loop until stopped or a fatal error occurs.
    pub async fn run(&self) -> Result<(), CommitteeError> {
        // The initial record backs references to batch -1; rewritten on
        // every start so aborted first batches can always resolve it.
        self.store_roots(-1, &self.applier.empty_roots()).await?;

        let mut next_id = self.load_cursor().await?;
        info!("Resuming from batch {next_id}");

        // Tracks a structurally rejected submission: seeing the identical
        // batch again afterwards means the rejection was not reorg-related.
        let mut last_rejected: Option<StateUpdate> = None;

        while !self.stop.is_stopped() {
            let poll = match self.gateway.get_batch_data(next_id).await {
                Ok(poll) => poll,
                Err(GatewayError::Transient(reason)) => {
                    error!("Gateway unreachable while polling batch {next_id}: {reason}");
                    self.sleep_interval().await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let update = match poll {
                BatchPoll::NotYetAvailable => {
                    info!("Waiting for batch {next_id}");
                    self.sleep_interval().await;
                    continue;
                }
                BatchPoll::Available(update) => update,
            };

            if last_rejected.as_ref() == Some(&update) {
                return Err(CommitteeError::SubmissionRejected { batch_id: next_id });
            }

            match self.process_batch(next_id, &update).await? {
                Outcome::Committed => {
                    last_rejected = None;
                    next_id += 1;
                    self.store_cursor(next_id).await?;
                }
                Outcome::Rewind(id) => {
                    last_rejected = None;
                    next_id = id;
                    self.store_cursor(next_id).await?;
                }
                Outcome::RetryLater => {
                    self.sleep_interval().await;
                }
                Outcome::Rejected => {
                    last_rejected = Some(update);
                    self.sleep_interval().await;
                }
            }
        }

        info!("Committee loop stopped");
        Ok(())
    }

    /// Reference check, apply, sign, submit. The root pointer is written
    /// only after the gateway acknowledged the submission; on a crash in
    /// between, the restarted node re-signs the same batch and the gateway
    /// deduplicates.
    async fn process_batch(
        &self,
        batch_id: i64,
        update: &StateUpdate,
    ) -> Result<Outcome, CommitteeError> {
        info!("Processing batch {batch_id}");
        info!("Using batch {} as reference", update.reference_batch_id);

        let reference_id = update.reference_batch_id;
        let reference = match self.load_roots(reference_id).await? {
            Some(roots) => roots,
            None => {
                warn!(
                    "Reference batch {reference_id} is not known locally; \
                     rewinding to ingest it first"
                );
                return Ok(Outcome::Rewind(reference_id));
            }
        };

        if reference.state_root != update.prev_batch_root {
            if reference_id == -1 {
                // There is nothing before the empty state to rewind to.
                return Err(ApplyError::Validation(format!(
                    "batch {batch_id} disagrees with the empty initial state"
                ))
                .into());
            }
            warn!(
                "Reference batch {reference_id} was superseded by the operator; \
                 rewinding to re-ingest it"
            );
            return Ok(Outcome::Rewind(reference_id));
        }

        let roots = self.applier.apply(update, &reference).await?;

        let claim = AvailabilityClaim {
            batch_id,
            state_root: roots.state_root,
            state_height: self.applier.state_height() as u64,
            order_root: roots.order_root,
            order_height: self.applier.order_height() as u64,
        };
        let attestation = self.signer.sign(&claim);
        info!(
            "Signing batch {batch_id} with claim 0x{}",
            attestation.claim_hash
        );

        match self.submit(batch_id, &attestation).await {
            Ok(()) => {
                self.store_roots(batch_id, &roots).await?;
                info!("Committed batch {batch_id}");
                Ok(Outcome::Committed)
            }
            Err(GatewayError::Rejected { status, body }) => {
                warn!(
                    "Gateway rejected signature for batch {batch_id} ({status}): {body}; \
                     discarding signature and re-fetching"
                );
                Ok(Outcome::Rejected)
            }
            Err(GatewayError::Transient(reason)) => {
                error!("Submission for batch {batch_id} kept failing: {reason}");
                Ok(Outcome::RetryLater)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Submits with bounded retries on transient failures. The signature
    /// bytes are identical across attempts; the gateway treats duplicates
    /// as idempotent.
    async fn submit(
        &self,
        batch_id: i64,
        attestation: &signer::Attestation,
    ) -> Result<(), GatewayError> {
        let mut attempt = 0;
        loop {
            let result = self
                .gateway
                .send_signature(
                    batch_id,
                    &attestation.signature,
                    &attestation.member_key,
                    &attestation.claim_hash,
                )
                .await;
            match result {
                Err(GatewayError::Transient(reason))
                    if attempt + 1 < self.submit_retry.max_attempts
                        && !self.stop.is_stopped() =>
                {
                    let delay = self.submit_retry.delay(attempt);
                    warn!(batch_id, attempt, ?delay, "submission failed: {reason}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn sleep_interval(&self) {
        tokio::time::sleep(self.polling_interval).await;
    }

    async fn load_cursor(&self) -> Result<i64, CommitteeError> {
        match self.storage.get(&cursor_key()).await? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| CommitteeError::CorruptCursor(e.to_string()))?;
                text.parse()
                    .map_err(|_| CommitteeError::CorruptCursor(text))
            }
            None => Ok(0),
        }
    }

    async fn store_cursor(&self, next_id: i64) -> Result<(), CommitteeError> {
        self.storage
            .set(&cursor_key(), next_id.to_string().as_bytes())
            .await?;
        Ok(())
    }

    async fn load_roots(&self, batch_id: i64) -> Result<Option<BatchRoots>, CommitteeError> {
        match self.storage.get(&root_record_key(batch_id)).await? {
            Some(bytes) => Ok(Some(BatchRoots::from_record(
                self.applier.profile(),
                &bytes,
            )?)),
            None => Ok(None),
        }
    }

    async fn store_roots(&self, batch_id: i64, roots: &BatchRoots) -> Result<(), CommitteeError> {
        self.storage
            .set(
                &root_record_key(batch_id),
                &roots.to_record(self.applier.profile()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle::{EmptySubtreeRoots, MerkleTree};
    use signer::verify_attestation;
    use state::{LeafValue, OrderLeaf, Profile, VaultLeaf};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use storage::MemoryStorage;

    const HEIGHT: usize = 4;
    const TEST_KEY: &str =
        "0xbfb1d570ddf495e378a1a85140e72d177a92637223fa540e05aaa061179f4290";

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Submission {
        batch_id: i64,
        signature: String,
        member_key: String,
        claim_hash: String,
    }

    /// Scripted gateway: per-id batch responses (the last entry keeps being
    /// served), a queue of submission outcomes (an exhausted queue accepts),
    /// and a stop switch flipped once every scripted response was served.
    struct ScriptedGateway {
        batches: HashMap<i64, Vec<BatchPoll>>,
        calls: Mutex<HashMap<i64, usize>>,
        remaining: AtomicUsize,
        submit_script: Mutex<Vec<Result<(), GatewayError>>>,
        submissions: Mutex<Vec<Submission>>,
        stop: StopHandle,
    }

    impl ScriptedGateway {
        fn new(script: Vec<(i64, BatchPoll)>, stop: StopHandle) -> Self {
            let total = script.len();
            let mut batches: HashMap<i64, Vec<BatchPoll>> = HashMap::new();
            for (id, poll) in script {
                batches.entry(id).or_default().push(poll);
            }
            Self {
                batches,
                calls: Mutex::new(HashMap::new()),
                remaining: AtomicUsize::new(total),
                submit_script: Mutex::new(Vec::new()),
                submissions: Mutex::new(Vec::new()),
                stop,
            }
        }

        fn with_submit_script(self, script: Vec<Result<(), GatewayError>>) -> Self {
            *self.submit_script.lock().unwrap() = script;
            self
        }

        fn submissions(&self) -> Vec<Submission> {
            self.submissions.lock().unwrap().clone()
        }
    }

    impl AvailabilityGateway for ScriptedGateway {
        async fn get_batch_data(&self, batch_id: i64) -> Result<BatchPoll, GatewayError> {
            let Some(responses) = self.batches.get(&batch_id) else {
                self.stop.stop();
                return Ok(BatchPoll::NotYetAvailable);
            };
            let mut calls = self.calls.lock().unwrap();
            let seen = calls.entry(batch_id).or_insert(0);
            let index = (*seen).min(responses.len() - 1);
            if *seen < responses.len() {
                *seen += 1;
                if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.stop.stop();
                }
            }
            Ok(responses[index].clone())
        }

        async fn get_last_batch_id(&self) -> Result<i64, GatewayError> {
            Ok(self.batches.keys().copied().max().unwrap_or(-1))
        }

        async fn send_signature(
            &self,
            batch_id: i64,
            signature: &str,
            member_key: &str,
            claim_hash: &str,
        ) -> Result<(), GatewayError> {
            self.submissions.lock().unwrap().push(Submission {
                batch_id,
                signature: signature.to_string(),
                member_key: member_key.to_string(),
                claim_hash: claim_hash.to_string(),
            });
            let mut script = self.submit_script.lock().unwrap();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
    }

    /// Builds branching batch histories on a scratch fact store, so scripts
    /// can declare correct roots. Facts are content-addressed, so divergent
    /// branches (reorgs) coexist on the same scratch store.
    struct Chain {
        scratch: FactStore<MemoryStorage>,
        state_empty: EmptySubtreeRoots,
        order_empty: EmptySubtreeRoots,
    }

    impl Chain {
        fn new() -> Self {
            Self {
                scratch: FactStore::new(MemoryStorage::new(), 1024),
                state_empty: EmptySubtreeRoots::new(
                    &Profile::StarkEx.empty_state_leaf(),
                    HEIGHT,
                ),
                order_empty: EmptySubtreeRoots::new(
                    &Profile::StarkEx.empty_order_leaf(),
                    HEIGHT,
                ),
            }
        }

        fn genesis(&self) -> BatchRoots {
            BatchRoots {
                state_root: self.state_empty.root(HEIGHT),
                order_root: self.order_empty.root(HEIGHT),
            }
        }

        async fn derive(
            &self,
            base: &BatchRoots,
            state_delta: &[(u64, Vec<u8>)],
            order_delta: &[(u64, Vec<u8>)],
        ) -> BatchRoots {
            let (state, _) = MerkleTree {
                root: base.state_root,
                height: HEIGHT,
            }
            .update(&self.scratch, &self.state_empty, state_delta)
            .await
            .unwrap();
            let (order, _) = MerkleTree {
                root: base.order_root,
                height: HEIGHT,
            }
            .update(&self.scratch, &self.order_empty, order_delta)
            .await
            .unwrap();
            BatchRoots {
                state_root: state.root,
                order_root: order.root,
            }
        }
    }

    fn vault(byte: u8) -> Vec<u8> {
        VaultLeaf::new([byte; 32], [byte; 32], byte as u64)
            .unwrap()
            .encode()
    }

    fn batch(
        batch_id: i64,
        reference_batch_id: i64,
        reference: &BatchRoots,
        next: &BatchRoots,
        state_delta: Vec<(u64, Vec<u8>)>,
        order_delta: Vec<(u64, Vec<u8>)>,
    ) -> BatchPoll {
        BatchPoll::Available(StateUpdate {
            batch_id,
            reference_batch_id,
            prev_batch_root: reference.state_root,
            next_batch_root: next.state_root,
            order_root: next.order_root,
            state_delta,
            order_delta,
        })
    }

    fn test_config() -> CommitteeConfig {
        let mut config = CommitteeConfig::for_profile(Profile::StarkEx, "http://gw.test");
        config.tree_height = Some(HEIGHT);
        config.order_tree_height = Some(HEIGHT);
        config.polling_interval_seconds = 0.001;
        config
    }

    fn build(
        script: Vec<(i64, BatchPoll)>,
        submit_script: Vec<Result<(), GatewayError>>,
        storage: Arc<MemoryStorage>,
    ) -> Committee<MemoryStorage, ScriptedGateway> {
        let stop = StopHandle::new();
        let gateway =
            ScriptedGateway::new(script, stop.clone()).with_submit_script(submit_script);
        let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
        let mut committee = Committee::new(&test_config(), storage, gateway, signer);
        committee.stop = stop;
        committee.submit_retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        committee
    }

    async fn stored_roots(
        committee: &Committee<MemoryStorage, ScriptedGateway>,
        batch_id: i64,
    ) -> Option<BatchRoots> {
        committee.load_roots(batch_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_empty_batch_is_signed_and_committed() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let script = vec![(0, batch(0, -1, &genesis, &genesis, vec![], vec![]))];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));

        committee.run().await.unwrap();

        let submissions = committee.gateway.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].batch_id, 0);

        let claim = AvailabilityClaim {
            batch_id: 0,
            state_root: genesis.state_root,
            state_height: HEIGHT as u64,
            order_root: genesis.order_root,
            order_height: HEIGHT as u64,
        };
        assert_eq!(submissions[0].claim_hash, hex::encode(claim.hash()));
        assert!(verify_attestation(
            &submissions[0].member_key,
            &claim,
            &submissions[0].signature
        )
        .unwrap());

        assert_eq!(stored_roots(&committee, 0).await, Some(genesis));
        assert_eq!(committee.load_cursor().await.unwrap(), 1);
        // root:-1, root:0 and the cursor; an empty batch writes no facts.
        assert_eq!(committee.storage.len(), 3);
    }

    #[tokio::test]
    async fn test_single_update_batch_commits_new_root() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let delta = vec![(3u64, vault(1))];
        let next = chain.derive(&genesis, &delta, &[]).await;
        assert_ne!(next.state_root, genesis.state_root);

        let script = vec![(0, batch(0, -1, &genesis, &next, delta, vec![]))];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));
        committee.run().await.unwrap();

        assert_eq!(stored_roots(&committee, 0).await, Some(next));
        // root:-1, root:0, cursor, plus one path of facts.
        assert_eq!(committee.storage.len(), 3 + HEIGHT + 1);
    }

    #[tokio::test]
    async fn test_duplicate_leaf_updates_persist_only_final_value() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let next = chain.derive(&genesis, &[(3, vault(2))], &[]).await;

        let script = vec![(
            0,
            batch(
                0,
                -1,
                &genesis,
                &next,
                vec![(3, vault(1)), (3, vault(2))],
                vec![],
            ),
        )];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));
        committee.run().await.unwrap();

        assert_eq!(stored_roots(&committee, 0).await, Some(next));
        let intermediate = merkle::fact_key(&merkle::hash_content(&vault(1)));
        assert_eq!(committee.storage.get(&intermediate).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_order_tree_delta_is_verified_and_committed() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let order_delta = vec![(
            2u64,
            OrderLeaf {
                fulfilled_amount: 50,
            }
            .encode(),
        )];
        let next = chain.derive(&genesis, &[], &order_delta).await;
        assert_ne!(next.order_root, genesis.order_root);

        let script = vec![(0, batch(0, -1, &genesis, &next, vec![], order_delta))];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));
        committee.run().await.unwrap();

        assert_eq!(stored_roots(&committee, 0).await, Some(next));
    }

    #[tokio::test]
    async fn test_reorg_rewinds_and_reingests_superseded_batch() {
        let chain = Chain::new();
        let genesis = chain.genesis();

        let delta0 = vec![(1u64, vault(1))];
        let roots0 = chain.derive(&genesis, &delta0, &[]).await;
        let delta1 = vec![(2u64, vault(2))];
        let roots1 = chain.derive(&roots0, &delta1, &[]).await;
        let delta2 = vec![(3u64, vault(3))];
        let roots2 = chain.derive(&roots1, &delta2, &[]).await;

        // The operator supersedes batch 2 with 2' (a different delta on the
        // same reference) and publishes batch 3 on top of 2'.
        let delta2p = vec![(4u64, vault(4))];
        let roots2p = chain.derive(&roots1, &delta2p, &[]).await;
        let delta3 = vec![(5u64, vault(5))];
        let roots3 = chain.derive(&roots2p, &delta3, &[]).await;

        let script = vec![
            (0, batch(0, -1, &genesis, &roots0, delta0, vec![])),
            (1, batch(1, 0, &roots0, &roots1, delta1, vec![])),
            (2, batch(2, 1, &roots1, &roots2, delta2, vec![])),
            // The second fetch of id 2 serves the superseding batch.
            (2, batch(2, 1, &roots1, &roots2p, delta2p, vec![])),
            // Served twice: first triggers the rewind, second commits.
            (3, batch(3, 2, &roots2p, &roots3, delta3.clone(), vec![])),
            (3, batch(3, 2, &roots2p, &roots3, delta3, vec![])),
        ];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));
        committee.run().await.unwrap();

        // Batch 2 now points at the superseding roots; batch 3 committed.
        assert_eq!(stored_roots(&committee, 2).await, Some(roots2p));
        assert_eq!(stored_roots(&committee, 3).await, Some(roots3));
        assert_eq!(committee.load_cursor().await.unwrap(), 4);

        // Facts of both histories remain available.
        let facts = committee.applier.facts();
        assert!(facts.get_node(&roots2.state_root).await.is_ok());
        assert!(facts.get_node(&roots2p.state_root).await.is_ok());

        // Batches 0..3 plus the superseded 2 were each signed once.
        let signed: Vec<i64> = committee
            .gateway
            .submissions()
            .iter()
            .map(|s| s.batch_id)
            .collect();
        assert_eq!(signed, vec![0, 1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_reference_rewinds_to_first_missing_id() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        // Batch 0 references batch 7, which this node never ingested.
        let script = vec![(0, batch(0, 7, &genesis, &genesis, vec![], vec![]))];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));
        committee.run().await.unwrap();

        assert_eq!(committee.load_cursor().await.unwrap(), 7);
        assert!(committee.gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_root_mismatch_is_fatal_and_nothing_is_signed() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let mut wrong = genesis;
        // One flipped bit in the declared root.
        wrong.state_root[0] ^= 1;

        let script = vec![(0, batch(0, -1, &genesis, &wrong, vec![], vec![]))];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));

        let err = committee.run().await.unwrap_err();
        assert!(matches!(
            err,
            CommitteeError::Apply(ApplyError::RootMismatch { .. })
        ));
        assert!(committee.gateway.submissions().is_empty());
        assert_eq!(stored_roots(&committee, 0).await, None);
        assert_eq!(committee.load_cursor().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_genesis_disagreement_is_fatal() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let mut bogus = genesis;
        bogus.state_root[0] ^= 1;

        let script = vec![(0, batch(0, -1, &bogus, &bogus, vec![], vec![]))];
        let committee = build(script, vec![], Arc::new(MemoryStorage::new()));

        let err = committee.run().await.unwrap_err();
        assert!(matches!(
            err,
            CommitteeError::Apply(ApplyError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_submission_retries_produce_identical_signatures() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let script = vec![(0, batch(0, -1, &genesis, &genesis, vec![], vec![]))];
        let submit_script = vec![
            Err(GatewayError::Transient("503 service unavailable".into())),
            Err(GatewayError::Transient("503 service unavailable".into())),
            Ok(()),
        ];
        let committee = build(script, submit_script, Arc::new(MemoryStorage::new()));

        committee.run().await.unwrap();

        let submissions = committee.gateway.submissions();
        assert_eq!(submissions.len(), 3);
        assert_eq!(submissions[0], submissions[1]);
        assert_eq!(submissions[1], submissions[2]);
        assert_eq!(stored_roots(&committee, 0).await, Some(genesis));
        assert_eq!(committee.load_cursor().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_submit_failure_resigns_identically() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let delta = vec![(3u64, vault(1))];
        let next = chain.derive(&genesis, &delta, &[]).await;
        let storage = Arc::new(MemoryStorage::new());

        // First run: facts are written, but every submission attempt fails,
        // so the root pointer is never committed.
        let script = vec![(0, batch(0, -1, &genesis, &next, delta.clone(), vec![]))];
        let submit_script = (0..5)
            .map(|_| Err(GatewayError::Transient("connection reset".into())))
            .collect();
        let committee = build(script, submit_script, Arc::clone(&storage));
        committee.run().await.unwrap();

        let first_attempts = committee.gateway.submissions();
        assert!(!first_attempts.is_empty());
        assert_eq!(stored_roots(&committee, 0).await, None);

        // Restart over the same storage: the batch is re-applied from the
        // already-written facts, the signature is byte-identical, and the
        // commit completes.
        let script = vec![(0, batch(0, -1, &genesis, &next, delta, vec![]))];
        let restarted = build(script, vec![], storage);
        restarted.run().await.unwrap();

        let submissions = restarted.gateway.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].signature, first_attempts[0].signature);
        assert_eq!(submissions[0].claim_hash, first_attempts[0].claim_hash);
        assert_eq!(stored_roots(&restarted, 0).await, Some(next));
        assert_eq!(restarted.load_cursor().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_rejection_of_identical_batch_is_fatal() {
        let chain = Chain::new();
        let genesis = chain.genesis();
        let script = vec![
            (0, batch(0, -1, &genesis, &genesis, vec![], vec![])),
            (0, batch(0, -1, &genesis, &genesis, vec![], vec![])),
        ];
        let submit_script = vec![Err(GatewayError::Rejected {
            status: 400,
            body: "unknown batch".into(),
        })];
        let committee = build(script, submit_script, Arc::new(MemoryStorage::new()));

        let err = committee.run().await.unwrap_err();
        assert!(matches!(
            err,
            CommitteeError::SubmissionRejected { batch_id: 0 }
        ));
        assert_eq!(stored_roots(&committee, 0).await, None);
    }

    #[test]
    fn test_storage_keys() {
        assert_eq!(root_record_key(5), b"root:5".to_vec());
        assert_eq!(root_record_key(-1), b"root:-1".to_vec());
        assert_eq!(cursor_key(), b"cursor:next_id".to_vec());
    }
}
