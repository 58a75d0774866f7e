//! Batch ingestion and attestation engine.
//!
//! This crate ties the node together: the batch applier reconstructs and
//! verifies Merkle state from gateway batch descriptors, and the committee
//! loop drives polling, signing, submission and commit ordering, including
//! reorg rewinds.

pub mod applier;
pub mod committee;
pub mod config;

pub use applier::{ApplyError, BatchApplier, BatchRoots};
pub use committee::{cursor_key, root_record_key, Committee, CommitteeError, StopHandle};
pub use config::CommitteeConfig;
