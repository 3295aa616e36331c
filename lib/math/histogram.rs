//! Bid counts bucketed by price tick, and the clearing median derived from
//! them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{SaleConfig, sale::MAX_GRANULARITY};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HistogramError {
    #[error("tick size must be non-zero")]
    ZeroTick,
    #[error("price range {start}..={end} is empty")]
    EmptyRange { start: u64, end: u64 },
    #[error("{ticks} ticks exceeds the maximum of {MAX_GRANULARITY}")]
    TooManyTicks { ticks: u64 },
    #[error("amount {amount} is outside {start}..={end}")]
    OutOfRange { amount: u64, start: u64, end: u64 },
    #[error("amount {amount} is not on a tick of {tick} from {start}")]
    OffTick { amount: u64, start: u64, tick: u64 },
    #[error("no bids recorded at {amount}")]
    Underflow { amount: u64 },
    #[error("bid count overflow at {amount}")]
    Overflow { amount: u64 },
    #[error("histogram has {actual} ticks, expected {expected}")]
    WidthMismatch { expected: usize, actual: usize },
}

/// Index of the median bucket: the smallest `i` whose cumulative count
/// reaches half of the total. `None` when there are no observations.
pub fn median_tick(counts: &[u64]) -> Option<usize> {
    let total: u128 = counts.iter().map(|&c| u128::from(c)).sum();
    if total == 0 {
        return None;
    }
    let mut cumulative = 0u128;
    counts.iter().position(|&count| {
        cumulative += u128::from(count);
        2 * cumulative >= total
    })
}

/// Clearing median price for a frequency table starting at `start` with
/// buckets `tick` apart.
pub fn median(counts: &[u64], start: u64, tick: u64) -> Option<u64> {
    let idx = median_tick(counts)?;
    tick.checked_mul(idx as u64)?.checked_add(start)
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TickHistogram {
    start: u64,
    tick: u64,
    counts: Vec<u64>,
}

impl TickHistogram {
    /// Empty histogram covering `start..=end`.
    pub fn new(start: u64, end: u64, tick: u64) -> Result<Self, HistogramError> {
        if tick == 0 {
            return Err(HistogramError::ZeroTick);
        }
        if end < start {
            return Err(HistogramError::EmptyRange { start, end });
        }
        let ticks = (end - start) / tick;
        if ticks > MAX_GRANULARITY {
            return Err(HistogramError::TooManyTicks { ticks });
        }
        let width = ticks as usize + 1;
        Ok(Self {
            start,
            tick,
            counts: vec![0; width],
        })
    }

    pub fn from_counts(
        start: u64,
        tick: u64,
        counts: Vec<u64>,
    ) -> Result<Self, HistogramError> {
        if tick == 0 {
            return Err(HistogramError::ZeroTick);
        }
        Ok(Self {
            start,
            tick,
            counts,
        })
    }

    /// Histogram as recorded on the sale. A sale with no recorded counts
    /// yields an empty histogram of the right width.
    pub fn from_sale(sale: &SaleConfig) -> Result<Self, HistogramError> {
        let mut histogram =
            Self::new(sale.price_range_start, sale.price_range_end, sale.tick_size)?;
        if !sale.counts_at_each_tick.is_empty() {
            if sale.counts_at_each_tick.len() != histogram.counts.len() {
                return Err(HistogramError::WidthMismatch {
                    expected: histogram.counts.len(),
                    actual: sale.counts_at_each_tick.len(),
                });
            }
            histogram.counts.clone_from(&sale.counts_at_each_tick);
        }
        Ok(histogram)
    }

    fn end(&self) -> u64 {
        self.price_at(self.counts.len().saturating_sub(1))
            .unwrap_or(self.start)
    }

    fn tick_of(&self, amount: u64) -> Result<usize, HistogramError> {
        let end = self.end();
        if amount < self.start || amount > end || self.counts.is_empty() {
            return Err(HistogramError::OutOfRange {
                amount,
                start: self.start,
                end,
            });
        }
        let offset = amount - self.start;
        if offset % self.tick != 0 {
            return Err(HistogramError::OffTick {
                amount,
                start: self.start,
                tick: self.tick,
            });
        }
        Ok((offset / self.tick) as usize)
    }

    /// Record a new bid at `amount`.
    pub fn observe(&mut self, amount: u64) -> Result<(), HistogramError> {
        let idx = self.tick_of(amount)?;
        self.counts[idx] = self.counts[idx]
            .checked_add(1)
            .ok_or(HistogramError::Overflow { amount })?;
        Ok(())
    }

    /// Remove a bid previously recorded at `amount`.
    pub fn withdraw(&mut self, amount: u64) -> Result<(), HistogramError> {
        let idx = self.tick_of(amount)?;
        self.counts[idx] = self.counts[idx]
            .checked_sub(1)
            .ok_or(HistogramError::Underflow { amount })?;
        Ok(())
    }

    /// Move a bid from `old` to `new`. `None` on either side means the bid
    /// did not exist before, or no longer exists after.
    pub fn adjust(
        &mut self,
        old: Option<u64>,
        new: Option<u64>,
    ) -> Result<(), HistogramError> {
        // Validate both sides before touching any count
        if let Some(amount) = old {
            let idx = self.tick_of(amount)?;
            if self.counts[idx] == 0 {
                return Err(HistogramError::Underflow { amount });
            }
        }
        if let Some(amount) = new {
            self.tick_of(amount)?;
        }
        if let Some(amount) = old {
            self.withdraw(amount)?;
        }
        if let Some(amount) = new {
            self.observe(amount)?;
        }
        Ok(())
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().fold(0u64, |acc, &c| acc.saturating_add(c))
    }

    pub fn median_tick(&self) -> Option<usize> {
        median_tick(&self.counts)
    }

    pub fn median(&self) -> Option<u64> {
        median(&self.counts, self.start, self.tick)
    }

    /// Price of bucket `idx`.
    pub fn price_at(&self, idx: usize) -> Option<u64> {
        self.tick.checked_mul(idx as u64)?.checked_add(self.start)
    }
}

/// An observation of the histogram made by a previous poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct MedianSnapshot {
    pub total: u64,
    pub median: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Poll {
    Unchanged,
    Updated(MedianSnapshot),
}

/// Polls a sale's bid counts for median updates. The caller owns the
/// previous snapshot and passes it back in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MedianWatch {
    start: u64,
    tick: u64,
}

impl MedianWatch {
    pub fn new(start: u64, tick: u64) -> Self {
        Self { start, tick }
    }

    pub fn from_sale(sale: &SaleConfig) -> Self {
        Self::new(sale.price_range_start, sale.tick_size)
    }

    pub fn poll(
        &self,
        counts: &[u64],
        previous: Option<&MedianSnapshot>,
    ) -> Poll {
        let total = counts.iter().fold(0u64, |acc, &c| acc.saturating_add(c));
        if previous.is_some_and(|prev| prev.total == total) {
            return Poll::Unchanged;
        }
        let snapshot = MedianSnapshot {
            total,
            median: median(counts, self.start, self.tick),
        };
        tracing::debug!(
            total,
            median = ?snapshot.median,
            "bid counts changed"
        );
        Poll::Updated(snapshot)
    }
}
