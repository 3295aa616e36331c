//! Core data types shared by every settlement component.

use std::{collections::HashSet, str::FromStr};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

pub mod sale;
pub mod ticket;

pub use sale::{AntiRugSetting, Phase, SaleConfig, SaleConfigError};
pub use ticket::{InvalidTransition, SequenceEntry, Ticket, TicketAction, TicketState};

/// Opaque 32-byte ledger account identifier
#[derive(
    BorshDeserialize,
    BorshSerialize,
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct AccountId(#[serde(with = "hex::serde")] pub [u8; 32]);

impl AccountId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for AccountId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// A raw ledger record as returned by the read API.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub key: AccountId,
    pub data: Vec<u8>,
}

/// Buyers that win a lottery slot before any random draw.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Whitelist(HashSet<AccountId>);

impl Whitelist {
    pub fn new<I>(buyers: I) -> Self
    where
        I: IntoIterator<Item = AccountId>,
    {
        Self(buyers.into_iter().collect())
    }

    /// Parse a JSON array of hex-encoded buyer identities.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn contains(&self, buyer: &AccountId) -> bool {
        self.0.contains(buyer)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
