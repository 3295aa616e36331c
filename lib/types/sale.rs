//! Sale parameters and phase boundaries.

use chrono::{DateTime, TimeZone as _, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AccountId;

/// Most ticks a sale's price range may be divided into
pub const MAX_GRANULARITY: u64 = 100;

/// Basis points denominator for the anti-rug reserve
pub const MAX_RESERVE_BP: u16 = 10_000;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SaleConfigError {
    #[error("phase boundaries are out of order")]
    TimestampsDontLineUp,
    #[error("tick size must be non-zero")]
    TickSizeTooSmall,
    #[error("sale must offer at least one token")]
    CannotGiveZeroTokens,
    #[error("price range end {end} must exceed start {start}")]
    InvalidPriceRanges { start: u64, end: u64 },
    #[error("price range is not a whole number of {tick} ticks")]
    TickSizeGivesRemainder { tick: u64 },
    #[error("{ticks} ticks exceeds the maximum of {MAX_GRANULARITY}")]
    TooMuchGranularity { ticks: u64 },
    #[error("lottery duration must not be negative")]
    InvalidLotteryDuration,
    #[error("anti-rug reserve of {0} bp exceeds {MAX_RESERVE_BP}")]
    InvalidReserveBp(u16),
    #[error(
        "anti-rug token requirement {requirement} exceeds tokens offered {offered}"
    )]
    InvalidAntiRugTokenRequirement { requirement: u64, offered: u64 },
    #[error("participation modulo must be non-zero")]
    InvalidParticipationModulo,
    #[error("histogram has {actual} ticks, expected {expected}")]
    TickCountMismatch { expected: usize, actual: usize },
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct AntiRugSetting {
    /// Basis points of the treasury held back until the requirement is met
    pub reserve_bp: u16,
    /// Token supply must fall below this to unlock the reserve
    pub token_requirement: u64,
    /// Unix timestamp after which pro-rated refunds open
    pub self_destruct_date: i64,
}

/// Sale phases, in the order a sale moves through them.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
)]
pub enum Phase {
    /// Before phase one opens
    Pending,
    /// Bidding; tick counts move
    PhaseOne,
    /// Counts are frozen, buyers may still adjust or withdraw
    PhaseTwo,
    /// Bidding has closed and the lottery may be drawn
    Lottery,
    /// Tickets are punched or refunded
    PhaseThree,
}

/// Read-only sale state consumed by a settlement pass.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct SaleConfig {
    pub sale: AccountId,
    pub tokens_offered: u64,
    /// Current supply of the sale's token mint
    pub tokens_minted: u64,
    pub tick_size: u64,
    pub price_range_start: u64,
    pub price_range_end: u64,
    pub phase_one_start: i64,
    pub phase_one_end: i64,
    pub phase_two_end: i64,
    pub lottery_duration: i64,
    pub anti_rug: Option<AntiRugSetting>,
    /// One in every `n` sequence numbers receives a participation reward
    pub participation_modulo: Option<u8>,
    pub phase_three_started: bool,
    pub tickets_sold: u64,
    /// Tickets that still lack a sequence index entry
    pub tickets_unsequenced: u64,
    pub current_eligible_holders: u64,
    pub current_median: u64,
    pub counts_at_each_tick: Vec<u64>,
}

impl SaleConfig {
    pub fn validate(&self) -> Result<(), SaleConfigError> {
        if self.phase_one_end < self.phase_one_start
            || self.phase_two_end < self.phase_one_end
        {
            return Err(SaleConfigError::TimestampsDontLineUp);
        }
        if self.tick_size == 0 {
            return Err(SaleConfigError::TickSizeTooSmall);
        }
        if self.tokens_offered == 0 {
            return Err(SaleConfigError::CannotGiveZeroTokens);
        }
        if self.price_range_end <= self.price_range_start {
            return Err(SaleConfigError::InvalidPriceRanges {
                start: self.price_range_start,
                end: self.price_range_end,
            });
        }
        let difference = self.price_range_end - self.price_range_start;
        if difference % self.tick_size != 0 {
            return Err(SaleConfigError::TickSizeGivesRemainder {
                tick: self.tick_size,
            });
        }
        let ticks = difference / self.tick_size;
        if ticks > MAX_GRANULARITY {
            return Err(SaleConfigError::TooMuchGranularity { ticks });
        }
        if self.lottery_duration < 0 {
            return Err(SaleConfigError::InvalidLotteryDuration);
        }
        if let Some(anti_rug) = &self.anti_rug {
            if anti_rug.reserve_bp > MAX_RESERVE_BP {
                return Err(SaleConfigError::InvalidReserveBp(
                    anti_rug.reserve_bp,
                ));
            }
            if anti_rug.token_requirement > self.tokens_offered {
                return Err(SaleConfigError::InvalidAntiRugTokenRequirement {
                    requirement: anti_rug.token_requirement,
                    offered: self.tokens_offered,
                });
            }
        }
        if self.participation_modulo == Some(0) {
            return Err(SaleConfigError::InvalidParticipationModulo);
        }
        let expected = self.tick_count();
        if !self.counts_at_each_tick.is_empty()
            && self.counts_at_each_tick.len() != expected
        {
            return Err(SaleConfigError::TickCountMismatch {
                expected,
                actual: self.counts_at_each_tick.len(),
            });
        }
        Ok(())
    }

    /// Number of histogram buckets, both range ends inclusive.
    pub fn tick_count(&self) -> usize {
        match self.tick_size {
            0 => 0,
            tick => {
                (self.price_range_end.saturating_sub(self.price_range_start)
                    / tick) as usize
                    + 1
            }
        }
    }

    /// Whether a bid lies within the price range on a tick mark.
    pub fn is_valid_amount(&self, amount: u64) -> bool {
        self.tick_size != 0
            && (self.price_range_start..=self.price_range_end).contains(&amount)
            && (amount - self.price_range_start) % self.tick_size == 0
    }

    /// Tokens still available to lottery winners.
    pub fn tokens_remaining(&self) -> Option<u64> {
        self.tokens_offered.checked_sub(self.tokens_minted)
    }

    pub fn participation_due(&self, sequence: u64) -> bool {
        match self.participation_modulo {
            Some(modulo) if modulo > 0 => sequence % u64::from(modulo) == 0,
            _ => false,
        }
    }

    /// End of the window in which the authority is expected to draw the
    /// lottery.
    pub fn lottery_deadline(&self) -> Option<DateTime<Utc>> {
        let deadline = self.phase_two_end.checked_add(self.lottery_duration)?;
        Utc.timestamp_opt(deadline, 0).single()
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> Phase {
        let now = now.timestamp();
        if self.phase_three_started {
            Phase::PhaseThree
        } else if now < self.phase_one_start {
            Phase::Pending
        } else if now <= self.phase_one_end {
            Phase::PhaseOne
        } else if now <= self.phase_two_end {
            Phase::PhaseTwo
        } else {
            Phase::Lottery
        }
    }
}
