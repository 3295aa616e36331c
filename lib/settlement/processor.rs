//! Drives every open ticket to `Punched` or `Withdrawn`.

use futures::{StreamExt as _, stream};
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SettlementConfig,
    ledger::{LedgerWriter, RemoteError},
    settlement::bitmap::LotteryBitmap,
    types::{AccountId, SaleConfig, Ticket, TicketAction},
    util::retry::{RetryPolicy, retry_classified},
};

/// What a ticket needs in order to reach a terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Plan {
    AlreadyTerminal,
    /// Adjust to zero
    Refund,
    Punch,
    /// Refund the amount above the median, then punch
    EqualizeThenPunch { to: u64 },
}

pub fn plan(ticket: &Ticket, median: u64, won: bool) -> Plan {
    if ticket.state.is_terminal() {
        Plan::AlreadyTerminal
    } else if ticket.amount < median || !won {
        Plan::Refund
    } else if ticket.amount > median {
        Plan::EqualizeThenPunch { to: median }
    } else {
        Plan::Punch
    }
}

/// A single remote write made on behalf of a ticket.
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    Participation,
    Refund,
    Equalize,
    Punch,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Participation {
    NotDue,
    Issued,
    Failed { reason: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    AlreadyTerminal,
    Punched,
    Withdrawn,
    Pending { step: Step, reason: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TicketReport {
    pub key: AccountId,
    pub sequence: u64,
    pub participation: Participation,
    pub resolution: Resolution,
}

/// A ticket left for a later pass.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PendingTicket {
    pub key: AccountId,
    pub sequence: u64,
    /// Step that exhausted its retries. `None` if the ticket was never
    /// started.
    pub step: Option<Step>,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct SettlementSummary {
    pub punched: u64,
    pub withdrawn: u64,
    pub already_terminal: u64,
    pub participation_issued: u64,
    pub pending: Vec<PendingTicket>,
    pub participation_pending: Vec<PendingTicket>,
}

impl SettlementSummary {
    pub fn record(&mut self, report: TicketReport) {
        match report.participation {
            Participation::NotDue => (),
            Participation::Issued => self.participation_issued += 1,
            Participation::Failed { reason } => {
                self.participation_pending.push(PendingTicket {
                    key: report.key,
                    sequence: report.sequence,
                    step: Some(Step::Participation),
                    reason,
                })
            }
        }
        match report.resolution {
            Resolution::AlreadyTerminal => self.already_terminal += 1,
            Resolution::Punched => self.punched += 1,
            Resolution::Withdrawn => self.withdrawn += 1,
            Resolution::Pending { step, reason } => {
                self.pending.push(PendingTicket {
                    key: report.key,
                    sequence: report.sequence,
                    step: Some(step),
                    reason,
                })
            }
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.punched += other.punched;
        self.withdrawn += other.withdrawn;
        self.already_terminal += other.already_terminal;
        self.participation_issued += other.participation_issued;
        self.pending.extend(other.pending);
        self.participation_pending.extend(other.participation_pending);
    }

    /// Tickets in a terminal state at the end of the pass
    pub fn resolved(&self) -> u64 {
        self.punched + self.withdrawn + self.already_terminal
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.participation_pending.is_empty()
    }

    /// Order pending tickets by sequence.
    pub fn sort(&mut self) {
        self.pending.sort_by_key(|p| p.sequence);
        self.participation_pending.sort_by_key(|p| p.sequence);
    }

    pub fn log(&self) {
        tracing::info!(
            punched = self.punched,
            withdrawn = self.withdrawn,
            already_terminal = self.already_terminal,
            participation_issued = self.participation_issued,
            "settled {} tickets, {} pending",
            self.resolved(),
            self.pending.len()
        );
        if !self.pending.is_empty() {
            tracing::warn!(
                "tickets still pending, run the pass again: {}",
                self.pending.iter().map(|p| p.key).join(", ")
            );
        }
        if !self.participation_pending.is_empty() {
            tracing::warn!(
                "participation rewards still pending for sequences {}",
                self.participation_pending.iter().map(|p| p.sequence).join(", ")
            );
        }
    }
}

pub struct SettlementProcessor<'a, W> {
    writer: &'a W,
    sale: &'a SaleConfig,
    bitmap: &'a LotteryBitmap,
    policy: RetryPolicy,
    chunk_size: usize,
    concurrency: usize,
}

impl<'a, W> SettlementProcessor<'a, W>
where
    W: LedgerWriter,
{
    pub fn new(
        writer: &'a W,
        sale: &'a SaleConfig,
        bitmap: &'a LotteryBitmap,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            writer,
            sale,
            bitmap,
            policy: config.write_retry,
            chunk_size: config.chunk_size.max(1),
            concurrency: config.settlement_concurrency.max(1),
        }
    }

    async fn submit<Op, Fut>(
        &self,
        ticket: &Ticket,
        step: Step,
        op: Op,
    ) -> Result<(), RemoteError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), RemoteError>>,
    {
        retry_classified(&self.policy, &format!("{step} ticket"), op)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ticket = %ticket.key,
                    seq = ticket.sequence,
                    %step,
                    "giving up on ticket: {err}"
                )
            })
    }

    async fn issue_participation(&self, ticket: &Ticket) -> Participation {
        if ticket.gotten_participation
            || !self.sale.participation_due(ticket.sequence)
        {
            return Participation::NotDue;
        }
        match self
            .submit(ticket, Step::Participation, |_| {
                self.writer.mint_participation_reward(ticket)
            })
            .await
        {
            Ok(()) => Participation::Issued,
            Err(err) => Participation::Failed {
                reason: err.to_string(),
            },
        }
    }

    async fn adjust(
        &self,
        ticket: &Ticket,
        step: Step,
        amount: u64,
    ) -> Result<Ticket, Resolution> {
        let pending = |reason: String| Resolution::Pending { step, reason };
        let mut next = ticket.clone();
        next.apply(TicketAction::Adjust { amount })
            .map_err(|err| pending(err.to_string()))?;
        self.submit(ticket, step, |_| self.writer.adjust_ticket(ticket, amount))
            .await
            .map_err(|err| pending(err.to_string()))?;
        Ok(next)
    }

    async fn punch(&self, ticket: &Ticket) -> Resolution {
        let pending = |reason: String| Resolution::Pending {
            step: Step::Punch,
            reason,
        };
        if let Err(err) = ticket.clone().apply(TicketAction::Punch) {
            return pending(err.to_string());
        }
        match self
            .submit(ticket, Step::Punch, |_| self.writer.punch_ticket(ticket))
            .await
        {
            Ok(()) => Resolution::Punched,
            Err(err) => pending(err.to_string()),
        }
    }

    /// Participation reward first, then refund and/or punch, strictly in
    /// that order.
    pub async fn settle_ticket(&self, ticket: &Ticket) -> TicketReport {
        let participation = self.issue_participation(ticket).await;
        let won = self.bitmap.is_winner(ticket.sequence);
        let plan = plan(ticket, self.sale.current_median, won);
        tracing::trace!(ticket = %ticket.key, seq = ticket.sequence, ?plan);
        let resolution = match plan {
            Plan::AlreadyTerminal => Resolution::AlreadyTerminal,
            Plan::Refund => match self.adjust(ticket, Step::Refund, 0).await {
                Ok(_) => Resolution::Withdrawn,
                Err(pending) => pending,
            },
            Plan::Punch => self.punch(ticket).await,
            Plan::EqualizeThenPunch { to } => {
                match self.adjust(ticket, Step::Equalize, to).await {
                    Ok(equalized) => self.punch(&equalized).await,
                    Err(pending) => pending,
                }
            }
        };
        TicketReport {
            key: ticket.key,
            sequence: ticket.sequence,
            participation,
            resolution,
        }
    }

    async fn settle_chunk(
        &self,
        chunk: usize,
        tickets: &[Ticket],
        cancel: &CancellationToken,
    ) -> SettlementSummary {
        let mut summary = SettlementSummary::default();
        for ticket in tickets {
            if cancel.is_cancelled() {
                summary.pending.push(PendingTicket {
                    key: ticket.key,
                    sequence: ticket.sequence,
                    step: None,
                    reason: "cancelled".to_owned(),
                });
                continue;
            }
            summary.record(self.settle_ticket(ticket).await);
        }
        tracing::info!(
            chunk,
            resolved = summary.resolved(),
            pending = summary.pending.len(),
            "settled chunk of {} tickets",
            tickets.len()
        );
        summary
    }

    /// Settle every ticket. Chunks run concurrently; a ticket whose writes
    /// exhaust their retries is reported as pending and never stops the
    /// pass. Once `cancel` fires no further ticket is started. The summary
    /// comes back sorted; logging it is up to the caller.
    pub async fn run(
        &self,
        tickets: &[Ticket],
        cancel: &CancellationToken,
    ) -> SettlementSummary {
        let mut summary = stream::iter(tickets.chunks(self.chunk_size).enumerate())
            .map(|(chunk, tickets)| self.settle_chunk(chunk, tickets, cancel))
            .buffer_unordered(self.concurrency)
            .fold(SettlementSummary::default(), |mut acc, summary| async move {
                acc.merge(summary);
                acc
            })
            .await;
        summary.sort();
        summary
    }
}
