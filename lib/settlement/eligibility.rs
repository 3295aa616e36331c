//! Partitioning of tickets against the clearing median.

use serde::{Deserialize, Serialize};

use crate::types::{Ticket, Whitelist};

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ClassifiedTicket {
    pub ticket: Ticket,
    /// Unpunched and bid at or above the median
    pub eligible: bool,
    pub whitelisted: bool,
    /// Set by the lottery
    pub chosen: bool,
}

impl ClassifiedTicket {
    /// Already punched or withdrawn
    pub fn is_resolved(&self) -> bool {
        self.ticket.state.is_terminal()
    }
}

/// Tag every ticket as eligible and/or whitelisted. An undefined median
/// (no bids observed) makes every ticket ineligible.
pub fn classify<I>(
    tickets: I,
    median: Option<u64>,
    whitelist: Option<&Whitelist>,
) -> Vec<ClassifiedTicket>
where
    I: IntoIterator<Item = Ticket>,
{
    tickets
        .into_iter()
        .map(|ticket| {
            let eligible = ticket.state.is_unpunched()
                && median.is_some_and(|median| ticket.amount >= median);
            let whitelisted =
                whitelist.is_some_and(|whitelist| whitelist.contains(&ticket.buyer));
            ClassifiedTicket {
                ticket,
                eligible,
                whitelisted,
                chosen: false,
            }
        })
        .collect()
}
