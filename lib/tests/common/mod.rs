//! In-memory ledger for driving a [`Settler`] end to end.
//!
//! Records are laid out the way the sale program stores them: an 8 byte
//! discriminator followed by the borsh-encoded account. Writes are checked
//! against the program's rules, so a settlement pass that would be rejected
//! on chain fails here too.

#![allow(dead_code)]

use std::collections::HashMap;

use borsh::{BorshDeserialize, BorshSerialize};
use fair_launch_settlement::{
    Settler,
    config::SettlementConfig,
    ledger::{
        DecodeError, LedgerReader, LedgerWriter, RecordDecoder, RemoteError,
        SaleSource,
    },
    settlement::bitmap::{ByteRange, LotteryBitmap},
    types::{AccountId, Record, SaleConfig, SequenceEntry, Ticket, TicketState},
    util::retry::RetryPolicy,
};
use parking_lot::Mutex;

pub const TICKET_DISCRIMINATOR: [u8; 8] = *b"ticket\0\0";
pub const SEQUENCE_DISCRIMINATOR: [u8; 8] = *b"seqlkup\0";
pub const BITMAP_DISCRIMINATOR: [u8; 8] = *b"lottery\0";

const TAG_TICKET: u8 = 1;
const TAG_SEQUENCE: u8 = 2;
const TAG_BITMAP: u8 = 3;
const TAG_BUYER: u8 = 4;

const STATE_NO_SEQUENCE: u8 = 0;
const STATE_UNPUNCHED: u8 = 1;
const STATE_PUNCHED: u8 = 2;
const STATE_WITHDRAWN: u8 = 3;

fn key(tag: u8, n: u64) -> AccountId {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[1..9].copy_from_slice(&n.to_le_bytes());
    AccountId::new(bytes)
}

pub fn ticket_key(seq: u64) -> AccountId {
    key(TAG_TICKET, seq)
}

pub fn buyer(seq: u64) -> AccountId {
    key(TAG_BUYER, seq)
}

#[derive(BorshSerialize, BorshDeserialize)]
struct TicketRecord {
    fair_launch: [u8; 32],
    buyer: [u8; 32],
    amount: u64,
    state: u8,
    bump: u8,
    seq: u64,
    gotten_participation: bool,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct SequenceRecord {
    ticket: [u8; 32],
    buyer: [u8; 32],
    seq: u64,
    bump: u8,
}

fn encode<T: BorshSerialize>(discriminator: [u8; 8], value: &T) -> Vec<u8> {
    let mut data = discriminator.to_vec();
    data.extend(borsh::to_vec(value).unwrap());
    data
}

fn decode<T: BorshDeserialize>(
    discriminator: [u8; 8],
    record: &Record,
) -> Result<T, DecodeError> {
    if record.data.len() < 8 {
        return Err(DecodeError::TooShort {
            expected: 8,
            actual: record.data.len(),
        });
    }
    let (head, body) = record.data.split_at(8);
    if head != discriminator {
        return Err(DecodeError::Invalid(format!(
            "unexpected discriminator {}",
            hex::encode(head)
        )));
    }
    T::try_from_slice(body).map_err(|err| DecodeError::Invalid(err.to_string()))
}

/// Operations that can be made to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Target {
    Read,
    Adjust(u64),
    Punch(u64),
    Participation(u64),
    BitmapRange(u32),
}

/// Successful writes, in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Write {
    Adjust { seq: u64, amount: u64 },
    Punch { seq: u64 },
    Participation { seq: u64 },
    CreateBitmap,
    BitmapRange { start_byte: u32 },
}

#[derive(Default)]
struct Inner {
    sale: SaleConfig,
    accounts: HashMap<AccountId, Vec<u8>>,
    /// Remaining injected failures per target
    failures: HashMap<Target, u32>,
    writes: Vec<Write>,
}

impl Inner {
    fn fail(&mut self, target: Target) -> Result<(), RemoteError> {
        match self.failures.get_mut(&target) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RemoteError::Transient(format!("injected failure: {target:?}")))
            }
            _ => Ok(()),
        }
    }

    fn ticket(&self, seq: u64) -> Result<TicketRecord, RemoteError> {
        let key = ticket_key(seq);
        let data = self
            .accounts
            .get(&key)
            .ok_or(RemoteError::NotFound { key })?;
        decode(TICKET_DISCRIMINATOR, &Record {
            key,
            data: data.clone(),
        })
        .map_err(|err| RemoteError::Fatal(err.to_string()))
    }

    fn put_ticket(&mut self, record: &TicketRecord) {
        self.accounts
            .insert(ticket_key(record.seq), encode(TICKET_DISCRIMINATOR, record));
    }

    fn bitmap(&self) -> Option<LotteryBitmap> {
        self.accounts
            .get(&key(TAG_BITMAP, 0))
            .and_then(|data| LotteryBitmap::decode(data).ok())
    }

    fn unpunched_in_phase_three(
        &self,
        seq: u64,
    ) -> Result<TicketRecord, RemoteError> {
        if !self.sale.phase_three_started {
            return Err(RemoteError::Fatal("phase three has not started".into()));
        }
        let record = self.ticket(seq)?;
        if record.state != STATE_UNPUNCHED {
            return Err(RemoteError::Fatal(format!(
                "ticket {seq} is in state {}",
                record.state
            )));
        }
        Ok(record)
    }

    fn is_winner(&self, seq: u64) -> bool {
        self.bitmap().is_some_and(|bitmap| bitmap.is_winner(seq))
    }
}

#[derive(Default)]
pub struct MockLedger {
    inner: Mutex<Inner>,
}

impl MockLedger {
    /// A sale in its lottery phase with one ticket per amount, all
    /// sequenced, on a 1..=9 price range with a tick of 1.
    pub fn new(amounts: &[u64], tokens_offered: u64) -> Self {
        let mut counts = vec![0u64; 9];
        for &amount in amounts {
            counts[(amount - 1) as usize] += 1;
        }
        let sale = SaleConfig {
            sale: key(0, 0),
            tokens_offered,
            tokens_minted: 0,
            tick_size: 1,
            price_range_start: 1,
            price_range_end: 9,
            phase_one_start: 1_000,
            phase_one_end: 2_000,
            phase_two_end: 3_000,
            lottery_duration: 86_400,
            tickets_sold: amounts.len() as u64,
            counts_at_each_tick: counts.clone(),
            current_median: fair_launch_settlement::math::median(&counts, 1, 1)
                .unwrap_or(0),
            ..Default::default()
        };
        let mut inner = Inner {
            sale,
            ..Default::default()
        };
        for (seq, &amount) in (0u64..).zip(amounts) {
            inner.put_ticket(&TicketRecord {
                fair_launch: *inner.sale.sale.as_bytes(),
                buyer: buyer(seq).0,
                amount,
                state: STATE_UNPUNCHED,
                bump: 255,
                seq,
                gotten_participation: false,
            });
            inner.accounts.insert(
                key(TAG_SEQUENCE, seq),
                encode(SEQUENCE_DISCRIMINATOR, &SequenceRecord {
                    ticket: ticket_key(seq).0,
                    buyer: buyer(seq).0,
                    seq,
                    bump: 254,
                }),
            );
        }
        inner.sale.current_eligible_holders = amounts
            .iter()
            .filter(|&&amount| amount >= inner.sale.current_median)
            .count() as u64;
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn update_sale(&self, f: impl FnOnce(&mut SaleConfig)) {
        f(&mut self.inner.lock().sale);
    }

    /// Start phase three, as the program does, only once the bitmap holds
    /// every winner.
    pub fn begin_phase_three(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let bitmap = inner
            .bitmap()
            .ok_or_else(|| anyhow::anyhow!("no lottery bitmap"))?;
        let expected = (inner.sale.tokens_offered - inner.sale.tokens_minted)
            .min(inner.sale.current_eligible_holders);
        anyhow::ensure!(
            bitmap.ones() == expected,
            "bitmap holds {} winners, expected {expected}",
            bitmap.ones()
        );
        inner.sale.phase_three_started = true;
        Ok(())
    }

    /// Fail the next `times` attempts at `target`.
    pub fn fail(&self, target: Target, times: u32) {
        self.inner.lock().failures.insert(target, times);
    }

    pub fn writes(&self) -> Vec<Write> {
        self.inner.lock().writes.clone()
    }

    pub fn ticket_state(&self, seq: u64) -> anyhow::Result<(TicketState, u64)> {
        let record = self.inner.lock().ticket(seq)?;
        let state = match record.state {
            STATE_UNPUNCHED => TicketState::Unpunched,
            STATE_PUNCHED => TicketState::Punched,
            STATE_WITHDRAWN => TicketState::Withdrawn,
            other => anyhow::bail!("ticket {seq} in state {other}"),
        };
        Ok((state, record.amount))
    }

    pub fn bitmap(&self) -> Option<LotteryBitmap> {
        self.inner.lock().bitmap()
    }

    /// Overwrite ticket `seq`'s state tag with one the program never writes.
    pub fn corrupt_ticket(&self, seq: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let mut record = inner.ticket(seq)?;
        record.state = 9;
        inner.put_ticket(&record);
        Ok(())
    }

    pub fn remove_ticket(&self, seq: u64) {
        self.inner.lock().accounts.remove(&ticket_key(seq));
    }

    pub fn gotten_participation(&self, seq: u64) -> anyhow::Result<bool> {
        Ok(self.inner.lock().ticket(seq)?.gotten_participation)
    }
}

impl LedgerReader for MockLedger {
    async fn get_multiple_accounts(
        &self,
        keys: &[AccountId],
    ) -> Result<Vec<Option<Vec<u8>>>, RemoteError> {
        let mut inner = self.inner.lock();
        inner.fail(Target::Read)?;
        Ok(keys.iter().map(|key| inner.accounts.get(key).cloned()).collect())
    }
}

impl LedgerWriter for MockLedger {
    async fn adjust_ticket(
        &self,
        ticket: &Ticket,
        new_amount: u64,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.fail(Target::Adjust(ticket.sequence))?;
        let mut record = inner.unpunched_in_phase_three(ticket.sequence)?;
        let median = inner.sale.current_median;
        let allowed = if record.amount < median || !inner.is_winner(record.seq) {
            new_amount == 0
        } else if record.amount > median {
            new_amount == median
        } else {
            false
        };
        if !allowed {
            return Err(RemoteError::Fatal(format!(
                "cannot adjust ticket {} from {} to {new_amount}",
                record.seq, record.amount
            )));
        }
        record.amount = new_amount;
        if new_amount == 0 {
            record.state = STATE_WITHDRAWN;
        }
        inner.put_ticket(&record);
        inner.writes.push(Write::Adjust {
            seq: record.seq,
            amount: new_amount,
        });
        Ok(())
    }

    async fn punch_ticket(&self, ticket: &Ticket) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.fail(Target::Punch(ticket.sequence))?;
        let mut record = inner.unpunched_in_phase_three(ticket.sequence)?;
        if record.amount != inner.sale.current_median
            || !inner.is_winner(record.seq)
        {
            return Err(RemoteError::Fatal(format!(
                "ticket {} is not a winner at the median",
                record.seq
            )));
        }
        record.state = STATE_PUNCHED;
        inner.put_ticket(&record);
        inner.writes.push(Write::Punch { seq: record.seq });
        Ok(())
    }

    async fn mint_participation_reward(
        &self,
        ticket: &Ticket,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.fail(Target::Participation(ticket.sequence))?;
        let mut record = inner.ticket(ticket.sequence)?;
        if record.gotten_participation
            || !inner.sale.participation_due(record.seq)
        {
            return Err(RemoteError::Fatal(format!(
                "ticket {} is not owed a participation reward",
                record.seq
            )));
        }
        record.gotten_participation = true;
        inner.put_ticket(&record);
        inner.writes.push(Write::Participation { seq: record.seq });
        Ok(())
    }

    async fn create_lottery_bitmap(&self) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        if inner.bitmap().is_some() {
            return Err(RemoteError::Fatal("bitmap already exists".into()));
        }
        let bitmap = LotteryBitmap::new(
            BITMAP_DISCRIMINATOR,
            inner.sale.sale,
            253,
            inner.sale.tickets_sold,
        );
        let data = bitmap
            .to_bytes()
            .map_err(|err| RemoteError::Fatal(err.to_string()))?;
        inner.accounts.insert(key(TAG_BITMAP, 0), data);
        inner.writes.push(Write::CreateBitmap);
        Ok(())
    }

    async fn write_bitmap_range(
        &self,
        start_byte: u32,
        bytes: &[u8],
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.fail(Target::BitmapRange(start_byte))?;
        if inner.sale.phase_three_started {
            return Err(RemoteError::Fatal("phase three has started".into()));
        }
        if inner.sale.tickets_unsequenced > 0 {
            return Err(RemoteError::Fatal("unsequenced tickets remain".into()));
        }
        let mut bitmap = inner
            .bitmap()
            .ok_or_else(|| RemoteError::Fatal("no bitmap".into()))?;
        bitmap
            .apply(&ByteRange {
                start_byte,
                bytes: bytes.to_vec(),
            })
            .map_err(|err| RemoteError::Fatal(err.to_string()))?;
        let data = bitmap
            .to_bytes()
            .map_err(|err| RemoteError::Fatal(err.to_string()))?;
        inner.accounts.insert(key(TAG_BITMAP, 0), data);
        inner.writes.push(Write::BitmapRange { start_byte });
        Ok(())
    }
}

impl SaleSource for MockLedger {
    async fn sale_config(&self) -> Result<SaleConfig, RemoteError> {
        Ok(self.inner.lock().sale.clone())
    }

    fn sequence_key(&self, _sale: &SaleConfig, sequence: u64) -> AccountId {
        key(TAG_SEQUENCE, sequence)
    }

    fn lottery_bitmap_key(&self, _sale: &SaleConfig) -> AccountId {
        key(TAG_BITMAP, 0)
    }
}

pub struct TestDecoder;

impl RecordDecoder for TestDecoder {
    fn decode_ticket(&self, record: &Record) -> Result<Ticket, DecodeError> {
        let raw: TicketRecord = decode(TICKET_DISCRIMINATOR, record)?;
        let state = match raw.state {
            STATE_UNPUNCHED => TicketState::Unpunched,
            STATE_PUNCHED => TicketState::Punched,
            STATE_WITHDRAWN => TicketState::Withdrawn,
            STATE_NO_SEQUENCE => {
                return Err(DecodeError::Invalid(
                    "ticket has no sequence entry".into(),
                ));
            }
            other => {
                return Err(DecodeError::Invalid(format!("unknown state {other}")));
            }
        };
        Ok(Ticket {
            key: record.key,
            buyer: AccountId::new(raw.buyer),
            sequence: raw.seq,
            amount: raw.amount,
            state,
            gotten_participation: raw.gotten_participation,
        })
    }

    fn decode_sequence_entry(
        &self,
        record: &Record,
    ) -> Result<SequenceEntry, DecodeError> {
        let raw: SequenceRecord = decode(SEQUENCE_DISCRIMINATOR, record)?;
        Ok(SequenceEntry {
            ticket: AccountId::new(raw.ticket),
            buyer: AccountId::new(raw.buyer),
            sequence: raw.seq,
        })
    }
}

pub fn config() -> SettlementConfig {
    SettlementConfig {
        page_size: 4,
        chunk_size: 3,
        fetch_concurrency: 2,
        settlement_concurrency: 2,
        lottery_seed: Some([42; 32]),
        fetch_retry: RetryPolicy::fixed(3, std::time::Duration::from_secs(10)),
        write_retry: RetryPolicy::fixed(3, std::time::Duration::from_secs(1)),
        ..Default::default()
    }
}

pub struct TestEnv {
    pub settler: Settler<MockLedger, TestDecoder>,
}

impl TestEnv {
    pub fn new(amounts: &[u64], tokens_offered: u64) -> anyhow::Result<Self> {
        Self::with_config(amounts, tokens_offered, config())
    }

    pub fn with_config(
        amounts: &[u64],
        tokens_offered: u64,
        config: SettlementConfig,
    ) -> anyhow::Result<Self> {
        init_tracing();
        let settler =
            Settler::new(MockLedger::new(amounts, tokens_offered), TestDecoder, config)?;
        Ok(Self { settler })
    }

    pub fn ledger(&self) -> &MockLedger {
        self.settler.ledger()
    }
}

pub fn init_tracing() {
    // Several tests share the global subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}
