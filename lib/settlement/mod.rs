//! Lottery draw and settlement passes over a whole sale.

use chrono::Utc;
use futures::{StreamExt as _, stream};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    config::{ConfigError, SettlementConfig},
    fetch::{self, AccountFetcher},
    ledger::{DecodeError, Ledger, RecordDecoder, RemoteError},
    math::{HistogramError, TickHistogram},
    types::{AccountId, Phase, SaleConfig, SaleConfigError, Ticket, Whitelist},
    util::retry::retry_classified,
};

pub mod bitmap;
pub mod eligibility;
pub mod lottery;
pub mod processor;

use bitmap::{BitmapError, ByteRange, LotteryBitmap};
use eligibility::{ClassifiedTicket, classify};
use lottery::{LotteryError, lottery_rng, select_winners, slots_remaining};
use processor::{PendingTicket, SettlementProcessor, SettlementSummary};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error("lottery bitmap is incomplete: {} ranges unwritten", pending.len())]
    BitmapIncomplete { pending: Vec<ByteRange> },
    #[error(
        "lottery bitmap has {ones} bits set, which no draw of {expected} winners can complete"
    )]
    BitmapInconsistent { ones: u64, expected: u64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] fetch::Error),
    #[error(transparent)]
    Histogram(#[from] HistogramError),
    #[error(transparent)]
    Lottery(#[from] LotteryError),
    #[error("lottery bitmap {key} does not exist")]
    MissingBitmap { key: AccountId },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Sale(#[from] SaleConfigError),
    #[error("{} tickets could not be read", skipped.len())]
    UnreadableTickets { skipped: Vec<SkippedTicket> },
    #[error("{count} tickets have no sequence entry yet")]
    UnsequencedTickets { count: u64 },
    #[error("sale is in {phase}, expected {required}")]
    WrongPhase { phase: Phase, required: Phase },
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum LotteryOutcome {
    /// The persisted bitmap already holds a complete draw
    AlreadyDrawn { ones: u64 },
    Drawn {
        /// Winning sequences, ascending
        winners: Vec<u64>,
        ranges_written: usize,
    },
}

/// Readiness of the persisted bitmap for phase three.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct LotteryVerification {
    /// Counter stored in the bitmap record
    pub ones: u64,
    /// Bits actually set in the bit array
    pub set_bits: u64,
    /// `min(tokens remaining, eligible holders)`
    pub expected: u64,
}

impl LotteryVerification {
    pub fn is_ready(&self) -> bool {
        self.ones == self.expected && self.set_bits == self.ones
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct LotteryRow {
    pub sequence: u64,
    pub ticket: AccountId,
    pub buyer: AccountId,
    pub won: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct LotteryReport {
    pub ones: u64,
    pub rows: Vec<LotteryRow>,
    /// Tickets whose records could not be read
    pub skipped: Vec<SkippedTicket>,
}

/// Why a ticket could not be read.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LoadError {
    #[error("record does not exist")]
    Missing,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("record holds sequence {found}, expected {expected}")]
    SequenceMismatch { expected: u64, found: u64 },
}

fn check_sequence(expected: u64, found: u64) -> Result<(), LoadError> {
    if found != expected {
        return Err(LoadError::SequenceMismatch { expected, found });
    }
    Ok(())
}

/// A ticket left out of a load.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct SkippedTicket {
    /// The unreadable record: the sequence entry, or the ticket it points to
    pub key: AccountId,
    pub sequence: u64,
    pub reason: String,
}

impl From<SkippedTicket> for PendingTicket {
    fn from(skipped: SkippedTicket) -> Self {
        Self {
            key: skipped.key,
            sequence: skipped.sequence,
            step: None,
            reason: skipped.reason,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadedTickets {
    /// Readable tickets, in sequence order
    pub tickets: Vec<Ticket>,
    /// In sequence order
    pub skipped: Vec<SkippedTicket>,
}

impl LoadedTickets {
    fn skip(&mut self, key: AccountId, sequence: u64, err: &LoadError) {
        tracing::warn!(%key, seq = sequence, "skipping ticket: {err}");
        self.skipped.push(SkippedTicket {
            key,
            sequence,
            reason: err.to_string(),
        });
    }

    /// Every ticket of the sale, or an error naming the unreadable ones.
    pub fn complete(self) -> Result<Vec<Ticket>, Error> {
        if !self.skipped.is_empty() {
            return Err(Error::UnreadableTickets {
                skipped: self.skipped,
            });
        }
        Ok(self.tickets)
    }
}

fn require_phase(sale: &SaleConfig, required: Phase) -> Result<(), Error> {
    let phase = sale.phase_at(Utc::now());
    if phase != required {
        return Err(Error::WrongPhase { phase, required });
    }
    Ok(())
}

pub struct Settler<L, D> {
    ledger: L,
    decoder: D,
    config: SettlementConfig,
}

impl<L, D> Settler<L, D>
where
    L: Ledger,
    D: RecordDecoder,
{
    pub fn new(
        ledger: L,
        decoder: D,
        config: SettlementConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            ledger,
            decoder,
            config,
        })
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub async fn sale(&self) -> Result<SaleConfig, Error> {
        let sale = retry_classified(&self.config.fetch_retry, "fetch sale", |_| {
            self.ledger.sale_config()
        })
        .await?;
        sale.validate()?;
        Ok(sale)
    }

    /// Every ticket of the sale in sequence order, discovered through the
    /// sequence index. A ticket whose records cannot be read is logged and
    /// skipped rather than failing the load.
    pub async fn load_tickets(
        &self,
        sale: &SaleConfig,
    ) -> Result<LoadedTickets, Error> {
        let fetcher = AccountFetcher::new(&self.ledger, &self.config);
        let index_keys: Vec<AccountId> = (0..sale.tickets_sold)
            .map(|seq| self.ledger.sequence_key(sale, seq))
            .collect();
        tracing::info!("reading {} sequence entries", index_keys.len());
        let entries = fetcher.fetch_many_lenient(&index_keys).await?;
        let mut loaded = LoadedTickets::default();
        let mut located = Vec::with_capacity(entries.len());
        for ((sequence, key), entry) in (0u64..).zip(&index_keys).zip(entries) {
            let read = entry.ok_or(LoadError::Missing).and_then(|record| {
                let entry = self.decoder.decode_sequence_entry(&record)?;
                check_sequence(sequence, entry.sequence)?;
                Ok(entry.ticket)
            });
            match read {
                Ok(ticket) => located.push((sequence, ticket)),
                Err(err) => loaded.skip(*key, sequence, &err),
            }
        }

        let ticket_keys: Vec<AccountId> =
            located.iter().map(|(_, key)| *key).collect();
        tracing::info!("reading {} tickets", ticket_keys.len());
        let records = fetcher.fetch_many_lenient(&ticket_keys).await?;
        for ((sequence, key), record) in located.into_iter().zip(records) {
            let read = record.ok_or(LoadError::Missing).and_then(|record| {
                let ticket = self.decoder.decode_ticket(&record)?;
                check_sequence(sequence, ticket.sequence)?;
                Ok(ticket)
            });
            match read {
                Ok(ticket) => loaded.tickets.push(ticket),
                Err(err) => loaded.skip(key, sequence, &err),
            }
        }
        loaded.skipped.sort_by_key(|skipped| skipped.sequence);
        Ok(loaded)
    }

    pub async fn load_bitmap(
        &self,
        sale: &SaleConfig,
    ) -> Result<Option<LotteryBitmap>, Error> {
        let key = self.ledger.lottery_bitmap_key(sale);
        let data = retry_classified(
            &self.config.fetch_retry,
            "fetch lottery bitmap",
            |_| async move {
                let mut records = self
                    .ledger
                    .get_multiple_accounts(std::slice::from_ref(&key))
                    .await?;
                Ok::<_, RemoteError>(records.pop().flatten())
            },
        )
        .await?;
        Ok(data.map(|data| LotteryBitmap::decode(&data)).transpose()?)
    }

    async fn require_bitmap(
        &self,
        sale: &SaleConfig,
    ) -> Result<LotteryBitmap, Error> {
        self.load_bitmap(sale).await?.ok_or_else(|| Error::MissingBitmap {
            key: self.ledger.lottery_bitmap_key(sale),
        })
    }

    /// Write `ranges` concurrently, each with its own retry budget. Ranges
    /// that exhaust their retries come back in the error.
    async fn write_ranges(&self, ranges: &[ByteRange]) -> Result<usize, Error> {
        let mut failed: Vec<ByteRange> = stream::iter(ranges)
            .map(|range| async move {
                let res = retry_classified(
                    &self.config.write_retry,
                    "write bitmap range",
                    |_| self.ledger.write_bitmap_range(range.start_byte, &range.bytes),
                )
                .await;
                (range, res)
            })
            .buffer_unordered(self.config.bitmap_write_concurrency)
            .filter_map(|(range, res)| async move {
                match res {
                    Ok(()) => {
                        tracing::debug!(
                            start_byte = range.start_byte,
                            "wrote sequences {:?}",
                            range.sequences()
                        );
                        None
                    }
                    Err(err) => {
                        tracing::error!(
                            start_byte = range.start_byte,
                            "failed to write bitmap range: {err}"
                        );
                        Some(range.clone())
                    }
                }
            })
            .collect()
            .await;
        if failed.is_empty() {
            return Ok(ranges.len());
        }
        failed.sort_by_key(|range| range.start_byte);
        Err(Error::BitmapIncomplete { pending: failed })
    }

    /// Resume an interrupted draw by writing the ranges reported in
    /// [`Error::BitmapIncomplete`]. Ranges already in place are skipped.
    pub async fn write_bitmap_ranges(
        &self,
        ranges: &[ByteRange],
    ) -> Result<usize, Error> {
        let sale = self.sale().await?;
        require_phase(&sale, Phase::Lottery)?;
        let bitmap = self.require_bitmap(&sale).await?;
        let missing: Vec<ByteRange> = ranges
            .iter()
            .filter(|range| !bitmap.contains(range))
            .cloned()
            .collect();
        // A range that does not fit must never reach the ledger
        let mut check = bitmap.clone();
        for range in &missing {
            check.apply(range)?;
        }
        tracing::info!(
            "{} of {} bitmap ranges left to write",
            missing.len(),
            ranges.len()
        );
        self.write_ranges(&missing).await
    }

    /// Draw the lottery with the configured seed, or fresh entropy.
    pub async fn draw_lottery(
        &self,
        whitelist: Option<&Whitelist>,
    ) -> Result<LotteryOutcome, Error> {
        let mut rng = lottery_rng(&self.config);
        self.draw_lottery_with_rng(whitelist, &mut rng).await
    }

    /// Choose the winners and persist them to the lottery bitmap. A bitmap
    /// that already holds a complete draw is left alone. One that holds part
    /// of a draw keeps every range already written, and only the winners
    /// still missing are drawn among the tickets of blank ranges.
    pub async fn draw_lottery_with_rng<R>(
        &self,
        whitelist: Option<&Whitelist>,
        rng: &mut R,
    ) -> Result<LotteryOutcome, Error>
    where
        R: Rng + ?Sized,
    {
        let span = tracing::info_span!("draw_lottery");
        async move {
            let sale = self.sale().await?;
            require_phase(&sale, Phase::Lottery)?;
            if sale.tickets_unsequenced > 0 {
                return Err(Error::UnsequencedTickets {
                    count: sale.tickets_unsequenced,
                });
            }
            let histogram = TickHistogram::from_sale(&sale)?;
            let median = match histogram.median() {
                None => {
                    tracing::warn!("no bids recorded, no ticket is eligible");
                    None
                }
                Some(observed) => {
                    if observed != sale.current_median {
                        tracing::warn!(
                            observed,
                            recorded = sale.current_median,
                            "histogram median disagrees with the sale, using the sale's"
                        );
                    }
                    Some(sale.current_median)
                }
            };

            // a draw over a partial ticket set would be wrong for good
            let tickets = self.load_tickets(&sale).await?.complete()?;
            let classified = classify(tickets, median, whitelist);
            let slots = slots_remaining(&sale, &classified)?;
            tracing::info!(
                tickets = classified.len(),
                eligible = classified.iter().filter(|c| c.eligible).count(),
                whitelisted = classified
                    .iter()
                    .filter(|c| c.eligible && c.whitelisted)
                    .count(),
                slots,
                "classified tickets"
            );

            let bitmap = match self.load_bitmap(&sale).await? {
                Some(bitmap) if bitmap.ones() == slots => {
                    tracing::info!(
                        ones = bitmap.ones(),
                        "lottery already drawn, skipping"
                    );
                    return Ok(LotteryOutcome::AlreadyDrawn {
                        ones: bitmap.ones(),
                    });
                }
                Some(bitmap)
                    if bitmap.ones() > slots
                        || bitmap.count_set_bits() != bitmap.ones() =>
                {
                    return Err(Error::BitmapInconsistent {
                        ones: bitmap.ones(),
                        expected: slots,
                    });
                }
                Some(bitmap) => bitmap,
                None => {
                    tracing::info!("creating lottery bitmap");
                    retry_classified(
                        &self.config.write_retry,
                        "create lottery bitmap",
                        |_| self.ledger.create_lottery_bitmap(),
                    )
                    .await?;
                    self.require_bitmap(&sale).await?
                }
            };

            let width = self.config.bitmap_write_width;
            let (written, blank): (Vec<ClassifiedTicket>, Vec<ClassifiedTicket>) =
                classified
                    .into_iter()
                    .partition(|c| bitmap.range_is_written(c.ticket.sequence, width));
            let needed = slots - bitmap.ones();
            let candidates = blank.iter().filter(|c| c.eligible).count() as u64;
            if candidates < needed {
                return Err(Error::BitmapInconsistent {
                    ones: bitmap.ones(),
                    expected: slots,
                });
            }
            if bitmap.ones() > 0 {
                tracing::warn!(
                    ones = bitmap.ones(),
                    needed,
                    "resuming a partially written draw"
                );
            }

            let chosen = select_winners(blank, needed, rng);
            let ranges = bitmap::encode(&chosen, width)?;
            let mut check = bitmap.clone();
            for range in &ranges {
                check.apply(range)?;
            }
            tracing::info!(
                "writing {} winners in {} ranges",
                check.ones() - bitmap.ones(),
                ranges.len()
            );
            let ranges_written = self.write_ranges(&ranges).await?;
            let mut winners: Vec<u64> = written
                .iter()
                .map(|c| c.ticket.sequence)
                .filter(|&seq| bitmap.is_winner(seq))
                .chain(chosen.iter().filter(|c| c.chosen).map(|c| c.ticket.sequence))
                .collect();
            winners.sort_unstable();
            Ok(LotteryOutcome::Drawn {
                winners,
                ranges_written,
            })
        }
        .instrument(span)
        .await
    }

    /// Compare the persisted bitmap with the number of winners phase three
    /// expects.
    pub async fn verify_lottery(&self) -> Result<LotteryVerification, Error> {
        let sale = self.sale().await?;
        let bitmap = self.require_bitmap(&sale).await?;
        let remaining =
            sale.tokens_remaining()
                .ok_or(LotteryError::NegativeSlots {
                    offered: sale.tokens_offered,
                    minted: sale.tokens_minted,
                })?;
        let verification = LotteryVerification {
            ones: bitmap.ones(),
            set_bits: bitmap.count_set_bits(),
            expected: remaining.min(sale.current_eligible_holders),
        };
        if verification.is_ready() {
            tracing::info!(ones = verification.ones, "lottery bitmap complete");
        } else {
            tracing::warn!(?verification, "lottery bitmap not ready");
        }
        Ok(verification)
    }

    /// Win or loss of every ticket according to the persisted bitmap.
    pub async fn lottery_report(&self) -> Result<LotteryReport, Error> {
        let sale = self.sale().await?;
        let bitmap = self.require_bitmap(&sale).await?;
        let LoadedTickets { tickets, skipped } = self.load_tickets(&sale).await?;
        let rows: Vec<LotteryRow> = tickets
            .into_iter()
            .map(|ticket| {
                let won = bitmap.is_winner(ticket.sequence);
                tracing::info!(
                    seq = ticket.sequence,
                    buyer = %ticket.buyer,
                    "{}",
                    if won { "won" } else { "lost" }
                );
                LotteryRow {
                    sequence: ticket.sequence,
                    ticket: ticket.key,
                    buyer: ticket.buyer,
                    won,
                }
            })
            .collect();
        Ok(LotteryReport {
            ones: bitmap.ones(),
            rows,
            skipped,
        })
    }

    /// One settlement pass. Safe to repeat until the summary is complete.
    /// Tickets that could not be read are reported pending and the rest
    /// are settled anyway.
    pub async fn settle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SettlementSummary, Error> {
        let span = tracing::info_span!("settle");
        async move {
            let sale = self.sale().await?;
            require_phase(&sale, Phase::PhaseThree)?;
            let bitmap = self.require_bitmap(&sale).await?;
            let LoadedTickets { tickets, skipped } = self.load_tickets(&sale).await?;
            tracing::info!(
                median = sale.current_median,
                winners = bitmap.ones(),
                skipped = skipped.len(),
                "settling {} tickets",
                tickets.len()
            );
            let mut summary = SettlementSummary {
                pending: skipped.into_iter().map(PendingTicket::from).collect(),
                ..Default::default()
            };
            summary.merge(
                SettlementProcessor::new(&self.ledger, &sale, &bitmap, &self.config)
                    .run(&tickets, cancel)
                    .await,
            );
            summary.sort();
            summary.log();
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}
