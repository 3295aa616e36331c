//! Winner selection when eligible demand exceeds the remaining supply.

use rand::{Rng, SeedableRng as _, rngs::StdRng};
use thiserror::Error;

use crate::{
    config::SettlementConfig, settlement::eligibility::ClassifiedTicket,
    types::SaleConfig,
};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LotteryError {
    #[error("{minted} tokens minted exceeds the {offered} offered")]
    NegativeSlots { offered: u64, minted: u64 },
}

/// Tokens left for lottery winners, capped at the number of eligible
/// tickets.
pub fn slots_remaining(
    sale: &SaleConfig,
    classified: &[ClassifiedTicket],
) -> Result<u64, LotteryError> {
    let remaining =
        sale.tokens_remaining()
            .ok_or(LotteryError::NegativeSlots {
                offered: sale.tokens_offered,
                minted: sale.tokens_minted,
            })?;
    let eligible = classified.iter().filter(|c| c.eligible).count() as u64;
    Ok(remaining.min(eligible))
}

/// Rng for a draw. A configured seed makes the draw reproducible.
pub fn lottery_rng(config: &SettlementConfig) -> StdRng {
    match config.lottery_seed {
        Some(seed) => StdRng::from_seed(seed),
        None => StdRng::from_entropy(),
    }
}

/// Mark up to `slots` eligible tickets as chosen: whitelisted tickets in
/// sequence order first, then a uniform draw among the rest. Ineligible
/// tickets are never chosen. The result is sorted by sequence.
pub fn select_winners<R>(
    mut classified: Vec<ClassifiedTicket>,
    slots: u64,
    rng: &mut R,
) -> Vec<ClassifiedTicket>
where
    R: Rng + ?Sized,
{
    classified.sort_by_key(|c| c.ticket.sequence);
    let eligible = classified.iter().filter(|c| c.eligible).count() as u64;
    let mut slots = slots.min(eligible);

    if slots == eligible {
        tracing::debug!(slots, "supply covers every eligible ticket");
        for c in classified.iter_mut().filter(|c| c.eligible) {
            c.chosen = true;
        }
        return classified;
    }

    for c in classified.iter_mut() {
        if slots == 0 {
            break;
        }
        if c.eligible && c.whitelisted {
            c.chosen = true;
            slots -= 1;
        }
    }
    tracing::debug!(slots, "whitelist pass done");

    let mut candidates: Vec<usize> = classified
        .iter()
        .enumerate()
        .filter(|(_, c)| c.eligible && !c.chosen)
        .map(|(idx, _)| idx)
        .collect();
    while slots > 0 && !candidates.is_empty() {
        let pick = candidates.swap_remove(rng.gen_range(0..candidates.len()));
        classified[pick].chosen = true;
        slots -= 1;
    }
    classified
}
