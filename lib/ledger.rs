//! Interfaces to the external ledger.
//!
//! The settlement engine never builds or signs instructions itself. It reads
//! raw records through [`LedgerReader`], learns the sale parameters and key
//! derivations from [`SaleSource`], submits one state transition at a time
//! through [`LedgerWriter`], and relies on a [`RecordDecoder`] for the byte
//! layout of ticket and sequence-index records.

use std::future::Future;

use thiserror::Error;

use crate::{
    types::{AccountId, Record, SaleConfig, SequenceEntry, Ticket},
    util::retry::{Classify, Retryability},
};

/// Failure reported by a remote read or write.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Network failure, timeout, rate limit or similar
    #[error("transient ledger failure: {0}")]
    Transient(String),
    /// The record does not exist yet
    #[error("record {key} not found")]
    NotFound { key: AccountId },
    /// Malformed input or an instruction the ledger rejected outright
    #[error("fatal ledger failure: {0}")]
    Fatal(String),
}

impl Classify for RemoteError {
    fn retryability(&self) -> Retryability {
        match self {
            Self::Transient(_) | Self::NotFound { .. } => Retryability::Retryable,
            Self::Fatal(_) => Retryability::Fatal,
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("record is {actual} bytes, expected at least {expected}")]
    TooShort { expected: usize, actual: usize },
    #[error("invalid record: {0}")]
    Invalid(String),
}

pub trait LedgerReader: Send + Sync {
    /// Read a page of records. The result has one entry per key, in key
    /// order, with `None` for records that do not exist.
    fn get_multiple_accounts(
        &self,
        keys: &[AccountId],
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>, RemoteError>> + Send;
}

pub trait LedgerWriter: Send + Sync {
    /// Set a ticket's amount on the buyer's behalf, refunding the
    /// difference. An amount of zero withdraws the ticket.
    fn adjust_ticket(
        &self,
        ticket: &Ticket,
        new_amount: u64,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn punch_ticket(
        &self,
        ticket: &Ticket,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn mint_participation_reward(
        &self,
        ticket: &Ticket,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Allocate the lottery bitmap record for the sale.
    fn create_lottery_bitmap(
        &self,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Overwrite `bytes.len()` bytes of the bit array starting at
    /// `start_byte`.
    fn write_bitmap_range(
        &self,
        start_byte: u32,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

pub trait SaleSource: Send + Sync {
    fn sale_config(
        &self,
    ) -> impl Future<Output = Result<SaleConfig, RemoteError>> + Send;

    /// Key of the sequence index entry for `sequence`
    fn sequence_key(&self, sale: &SaleConfig, sequence: u64) -> AccountId;

    fn lottery_bitmap_key(&self, sale: &SaleConfig) -> AccountId;
}

/// Full ledger access required by [`crate::Settler`].
pub trait Ledger: LedgerReader + LedgerWriter + SaleSource {}

impl<T> Ledger for T where T: LedgerReader + LedgerWriter + SaleSource {}

pub trait RecordDecoder: Send + Sync {
    fn decode_ticket(&self, record: &Record) -> Result<Ticket, DecodeError>;

    fn decode_sequence_entry(
        &self,
        record: &Record,
    ) -> Result<SequenceEntry, DecodeError>;
}
