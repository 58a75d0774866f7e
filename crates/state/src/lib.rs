//! Account-state profiles and batch descriptors.
//!
//! This crate defines the leaf types the committee trees commit to, their
//! canonical byte encodings, and the parsing of availability-gateway batch
//! payloads into typed state updates. Two profiles are supported: the spot
//! exchange profile (vault leaves) and the perpetual profile (position
//! leaves); both carry an auxiliary order tree.

use std::collections::BTreeMap;

use merkle::Hash32;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while decoding leaves or batch payloads.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid hex field '{value}': {reason}")]
    InvalidHex { value: String, reason: String },
    #[error("invalid update entry at position {position}: {reason}")]
    InvalidEntry { position: usize, reason: String },
    #[error("invalid vault: {0}")]
    InvalidVault(String),
    #[error("batch descriptor missing field: {0}")]
    MissingField(&'static str),
}

/// A leaf value with a canonical byte encoding.
///
/// The encoding is the content of the leaf's Merkle fact; equal values must
/// encode identically.
pub trait LeafValue: Sized {
    fn empty() -> Self;
    fn is_empty(&self) -> bool;
    fn encode(&self) -> Vec<u8>;
}

/// Parses a 0x-less (or 0x-prefixed) hex integer into a left-padded 32-byte
/// field element.
pub fn parse_hex_field(value: &str) -> Result<Hash32, StateError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    let padded = if digits.len() % 2 == 1 {
        format!("0{digits}")
    } else {
        digits.to_string()
    };
    let bytes = hex::decode(&padded).map_err(|e| StateError::InvalidHex {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if bytes.len() > 32 {
        return Err(StateError::InvalidHex {
            value: value.to_string(),
            reason: format!("{} bytes exceeds field size", bytes.len()),
        });
    }
    let mut field = [0u8; 32];
    field[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(field)
}

fn u64_field(value: u64) -> [u8; 32] {
    let mut field = [0u8; 32];
    field[24..].copy_from_slice(&value.to_be_bytes());
    field
}

/// A spot-exchange vault: the state-tree leaf of the `stark_ex` profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultLeaf {
    pub stark_key: Hash32,
    pub token: Hash32,
    pub balance: u64,
}

impl VaultLeaf {
    /// A zero balance clears the key and token; a non-empty vault must name
    /// both.
    pub fn new(stark_key: Hash32, token: Hash32, balance: u64) -> Result<Self, StateError> {
        if balance == 0 {
            return Ok(Self {
                stark_key: [0u8; 32],
                token: [0u8; 32],
                balance: 0,
            });
        }
        if stark_key == [0u8; 32] {
            return Err(StateError::InvalidVault(
                "a non-empty vault cannot have an empty stark key".into(),
            ));
        }
        if token == [0u8; 32] {
            return Err(StateError::InvalidVault(
                "a non-empty vault cannot have an empty token".into(),
            ));
        }
        Ok(Self {
            stark_key,
            token,
            balance,
        })
    }
}

impl LeafValue for VaultLeaf {
    fn empty() -> Self {
        Self {
            stark_key: [0u8; 32],
            token: [0u8; 32],
            balance: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.balance == 0
    }

    fn encode(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(96);
        content.extend_from_slice(&self.stark_key);
        content.extend_from_slice(&self.token);
        content.extend_from_slice(&u64_field(self.balance));
        content
    }
}

/// An order-tree leaf: fulfilled amount of an order, or minted amount of a
/// mintable asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLeaf {
    pub fulfilled_amount: u64,
}

impl LeafValue for OrderLeaf {
    fn empty() -> Self {
        Self {
            fulfilled_amount: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.fulfilled_amount == 0
    }

    fn encode(&self) -> Vec<u8> {
        u64_field(self.fulfilled_amount).to_vec()
    }
}

/// A synthetic-asset holding inside a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionAsset {
    pub balance: i64,
    pub cached_funding_index: i64,
}

/// A perpetual-exchange position: the state-tree leaf of the `perpetual`
/// profile. Assets are keyed by asset id; the encoding lists them in id
/// order so equal positions encode identically.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PositionLeaf {
    pub public_key: Hash32,
    pub collateral_balance: i64,
    pub assets: BTreeMap<u32, PositionAsset>,
}

impl LeafValue for PositionLeaf {
    fn empty() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.public_key == [0u8; 32] && self.collateral_balance == 0 && self.assets.is_empty()
    }

    fn encode(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(44 + self.assets.len() * 20);
        content.extend_from_slice(&self.public_key);
        content.extend_from_slice(&self.collateral_balance.to_be_bytes());
        content.extend_from_slice(&(self.assets.len() as u32).to_be_bytes());
        for (asset_id, asset) in &self.assets {
            content.extend_from_slice(&asset_id.to_be_bytes());
            content.extend_from_slice(&asset.balance.to_be_bytes());
            content.extend_from_slice(&asset.cached_funding_index.to_be_bytes());
        }
        content
    }
}

/// Raw batch payload as served by the availability gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchDataJson {
    pub batch_id: i64,
    pub reference_batch_id: i64,
    pub prev_batch_root: String,
    pub next_batch_root: String,
    #[serde(default)]
    pub order_root: Option<String>,
    #[serde(default)]
    pub update_entries: Vec<serde_json::Value>,
    #[serde(default)]
    pub order_entries: Vec<serde_json::Value>,
}

/// A fully decoded batch descriptor. Deltas carry encoded leaf contents;
/// later entries overwrite earlier ones at the same index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub batch_id: i64,
    pub reference_batch_id: i64,
    pub prev_batch_root: Hash32,
    pub next_batch_root: Hash32,
    pub order_root: Hash32,
    pub state_delta: Vec<(u64, Vec<u8>)>,
    pub order_delta: Vec<(u64, Vec<u8>)>,
}

/// The account-state profile the committee is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    StarkEx,
    Perpetual,
}

impl Profile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stark_ex" => Some(Profile::StarkEx),
            "perpetual" => Some(Profile::Perpetual),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Profile::StarkEx => "stark_ex",
            Profile::Perpetual => "perpetual",
        }
    }

    /// Name of the state tree in root records and logs.
    pub fn state_tree_name(&self) -> &'static str {
        match self {
            Profile::StarkEx => "vault",
            Profile::Perpetual => "position",
        }
    }

    pub fn order_tree_name(&self) -> &'static str {
        "order"
    }

    pub fn default_state_height(&self) -> usize {
        match self {
            Profile::StarkEx => 31,
            Profile::Perpetual => 64,
        }
    }

    pub fn default_order_height(&self) -> usize {
        31
    }

    /// Canonical encoding of the profile's empty state leaf.
    pub fn empty_state_leaf(&self) -> Vec<u8> {
        match self {
            Profile::StarkEx => VaultLeaf::empty().encode(),
            Profile::Perpetual => PositionLeaf::empty().encode(),
        }
    }

    pub fn empty_order_leaf(&self) -> Vec<u8> {
        OrderLeaf::empty().encode()
    }

    fn parse_state_entry(
        &self,
        position: usize,
        row: &serde_json::Value,
    ) -> Result<(u64, Vec<u8>), StateError> {
        let invalid = |reason: String| StateError::InvalidEntry { position, reason };
        match self {
            Profile::StarkEx => {
                let (index, stark_key, token, balance): (u64, String, String, u64) =
                    serde_json::from_value(row.clone())
                        .map_err(|e| invalid(e.to_string()))?;
                let leaf = VaultLeaf::new(
                    parse_hex_field(&stark_key)?,
                    parse_hex_field(&token)?,
                    balance,
                )?;
                Ok((index, leaf.encode()))
            }
            Profile::Perpetual => {
                let (index, public_key, collateral_balance, assets): (
                    u64,
                    String,
                    i64,
                    Vec<(u32, i64, i64)>,
                ) = serde_json::from_value(row.clone())
                    .map_err(|e| invalid(e.to_string()))?;
                let leaf = PositionLeaf {
                    public_key: parse_hex_field(&public_key)?,
                    collateral_balance,
                    assets: assets
                        .into_iter()
                        .map(|(id, balance, cached_funding_index)| {
                            (
                                id,
                                PositionAsset {
                                    balance,
                                    cached_funding_index,
                                },
                            )
                        })
                        .collect(),
                };
                Ok((index, leaf.encode()))
            }
        }
    }

    fn parse_order_entry(
        &self,
        position: usize,
        row: &serde_json::Value,
    ) -> Result<(u64, Vec<u8>), StateError> {
        let (index, fulfilled_amount): (u64, u64) = serde_json::from_value(row.clone())
            .map_err(|e| StateError::InvalidEntry {
                position,
                reason: e.to_string(),
            })?;
        Ok((index, OrderLeaf { fulfilled_amount }.encode()))
    }

    /// Decodes a raw gateway payload into a typed state update.
    pub fn parse_batch_data(&self, raw: &BatchDataJson) -> Result<StateUpdate, StateError> {
        let order_root = raw
            .order_root
            .as_deref()
            .ok_or(StateError::MissingField("order_root"))?;

        let state_delta = raw
            .update_entries
            .iter()
            .enumerate()
            .map(|(i, row)| self.parse_state_entry(i, row))
            .collect::<Result<Vec<_>, _>>()?;
        let order_delta = raw
            .order_entries
            .iter()
            .enumerate()
            .map(|(i, row)| self.parse_order_entry(i, row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StateUpdate {
            batch_id: raw.batch_id,
            reference_batch_id: raw.reference_batch_id,
            prev_batch_root: parse_hex_field(&raw.prev_batch_root)?,
            next_batch_root: parse_hex_field(&raw.next_batch_root)?,
            order_root: parse_hex_field(order_root)?,
            state_delta,
            order_delta,
        })
    }
}
