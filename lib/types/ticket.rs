//! Tickets and their one-directional state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AccountId;

/// Lifecycle of a ticket. `Punched` and `Withdrawn` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIs,
)]
pub enum TicketState {
    Unpunched,
    Punched,
    Withdrawn,
}

/// A state-changing instruction that can be applied to a ticket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TicketAction {
    /// Set the ticket amount. An amount of zero withdraws the ticket.
    Adjust { amount: u64 },
    /// Deliver the purchased token.
    Punch,
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("cannot apply {action:?} to a {state} ticket")]
pub struct InvalidTransition {
    pub state: TicketState,
    pub action: TicketAction,
}

impl TicketState {
    pub fn is_terminal(self) -> bool {
        !self.is_unpunched()
    }

    /// The single transition function for tickets.
    pub fn transition(
        self,
        action: TicketAction,
    ) -> Result<TicketState, InvalidTransition> {
        match (self, action) {
            (Self::Unpunched, TicketAction::Adjust { amount: 0 }) => {
                Ok(Self::Withdrawn)
            }
            (Self::Unpunched, TicketAction::Adjust { .. }) => {
                Ok(Self::Unpunched)
            }
            (Self::Unpunched, TicketAction::Punch) => Ok(Self::Punched),
            (Self::Punched | Self::Withdrawn, action) => {
                Err(InvalidTransition {
                    state: self,
                    action,
                })
            }
        }
    }
}

/// A buyer's bid, decoded from its ledger record.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Ticket {
    /// Ledger key of the ticket record
    pub key: AccountId,
    pub buyer: AccountId,
    /// Dense arrival index, also the ticket's lottery bit index
    pub sequence: u64,
    pub amount: u64,
    pub state: TicketState,
    pub gotten_participation: bool,
}

impl Ticket {
    /// Apply an action to the local view of the ticket.
    pub fn apply(&mut self, action: TicketAction) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(action)?;
        if let TicketAction::Adjust { amount } = action {
            self.amount = amount;
        }
        Ok(())
    }
}

/// Entry of the per-sale sequence index, pointing at a ticket record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct SequenceEntry {
    pub ticket: AccountId,
    pub buyer: AccountId,
    pub sequence: u64,
}
