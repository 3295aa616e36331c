//! The persisted lottery bitmap: one bit per ticket sequence, MSB first
//! within each byte.
//!
//! Record layout:
//!
//! | bytes   | field                               |
//! |---------|-------------------------------------|
//! | 0..8    | discriminator                       |
//! | 8..40   | sale key                            |
//! | 40      | bump                                |
//! | 41..49  | number of set bits, little endian   |
//! | 49..    | bit array                           |

use std::ops::Range;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{settlement::eligibility::ClassifiedTicket, types::AccountId};

pub const BITMAP_METADATA_LEN: usize = 41;
pub const BITMAP_ONES_LEN: usize = 8;
pub const BITMAP_DATA_OFFSET: usize = BITMAP_METADATA_LEN + BITMAP_ONES_LEN;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BitmapError {
    #[error("bitmap record is {actual} bytes, expected at least {expected}")]
    TooShort { expected: usize, actual: usize },
    #[error("malformed bitmap header: {0}")]
    Header(String),
    #[error("sequence {0} appears more than once")]
    DuplicateSequence(u64),
    #[error(
        "range of {len} bytes at byte {start_byte} exceeds the {capacity} byte bitmap"
    )]
    OutOfBounds {
        start_byte: u32,
        len: usize,
        capacity: usize,
    },
    #[error("byte offset {0} does not fit the write api")]
    OffsetOverflow(usize),
    #[error("bitmap write width must be non-zero")]
    ZeroWidth,
    #[error("set bit counter out of range")]
    OnesOverflow,
}

/// Bit mask within its byte, and byte index, of `sequence`.
pub fn mask_and_index(sequence: u64) -> (u8, usize) {
    (1 << (7 - sequence % 8), (sequence / 8) as usize)
}

fn count_ones(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| u64::from(b.count_ones())).sum()
}

/// A self-contained slice of the bit array, addressed by its first byte.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ByteRange {
    pub start_byte: u32,
    #[serde(with = "hex::serde")]
    pub bytes: Vec<u8>,
}

impl ByteRange {
    pub fn first_sequence(&self) -> u64 {
        u64::from(self.start_byte) * 8
    }

    /// Sequences whose bits this range carries
    pub fn sequences(&self) -> Range<u64> {
        let first = self.first_sequence();
        first..first + self.bytes.len() as u64 * 8
    }

    pub fn ones(&self) -> u64 {
        count_ones(&self.bytes)
    }
}

/// Pack the chosen flags of `classified` by sequence and split the packed
/// bytes into ranges of `width` bytes. Ranges without a single winner are
/// left out, since a fresh bitmap is zeroed.
pub fn encode(
    classified: &[ClassifiedTicket],
    width: usize,
) -> Result<Vec<ByteRange>, BitmapError> {
    if width == 0 {
        return Err(BitmapError::ZeroWidth);
    }
    let Some(max_sequence) = classified.iter().map(|c| c.ticket.sequence).max()
    else {
        return Ok(Vec::new());
    };
    let mut bits = vec![0u8; (max_sequence / 8) as usize + 1];
    let mut seen = vec![0u8; bits.len()];
    for c in classified {
        let (mask, idx) = mask_and_index(c.ticket.sequence);
        if seen[idx] & mask != 0 {
            return Err(BitmapError::DuplicateSequence(c.ticket.sequence));
        }
        seen[idx] |= mask;
        if c.chosen {
            bits[idx] |= mask;
        }
    }
    bits.chunks(width)
        .enumerate()
        .filter(|(_, bytes)| bytes.iter().any(|&b| b != 0))
        .map(|(chunk, bytes)| {
            let offset = chunk * width;
            let start_byte = u32::try_from(offset)
                .map_err(|_| BitmapError::OffsetOverflow(offset))?;
            Ok(ByteRange {
                start_byte,
                bytes: bytes.to_vec(),
            })
        })
        .collect()
}

/// Fixed-size prefix of the bitmap record.
#[derive(BorshDeserialize, BorshSerialize, Clone, Debug, Eq, PartialEq)]
pub struct BitmapHeader {
    pub discriminator: [u8; 8],
    pub sale: AccountId,
    pub bump: u8,
    /// Set bits in the bit array
    pub ones: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LotteryBitmap {
    header: BitmapHeader,
    bits: Vec<u8>,
}

impl LotteryBitmap {
    /// Bytes of bit array allocated for a sale with `tickets_sold` tickets
    pub fn capacity_for(tickets_sold: u64) -> usize {
        (tickets_sold / 8) as usize + 1
    }

    /// Zeroed bitmap able to hold `tickets_sold` bits.
    pub fn new(
        discriminator: [u8; 8],
        sale: AccountId,
        bump: u8,
        tickets_sold: u64,
    ) -> Self {
        Self {
            header: BitmapHeader {
                discriminator,
                sale,
                bump,
                ones: 0,
            },
            bits: vec![0; Self::capacity_for(tickets_sold)],
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, BitmapError> {
        if data.len() < BITMAP_DATA_OFFSET {
            return Err(BitmapError::TooShort {
                expected: BITMAP_DATA_OFFSET,
                actual: data.len(),
            });
        }
        let mut bits = data;
        let header = BitmapHeader::deserialize(&mut bits)
            .map_err(|err| BitmapError::Header(err.to_string()))?;
        Ok(Self {
            header,
            bits: bits.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> borsh::io::Result<Vec<u8>> {
        let mut data = borsh::to_vec(&self.header)?;
        data.extend_from_slice(&self.bits);
        Ok(data)
    }

    pub fn header(&self) -> &BitmapHeader {
        &self.header
    }

    /// Persisted count of set bits.
    pub fn ones(&self) -> u64 {
        self.header.ones
    }

    /// Recount of the set bits in the bit array.
    pub fn count_set_bits(&self) -> u64 {
        count_ones(&self.bits)
    }

    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Whether `sequence` won. Sequences past the end of the bit array
    /// did not.
    pub fn is_winner(&self, sequence: u64) -> bool {
        let (mask, idx) = mask_and_index(sequence);
        self.bits.get(idx).is_some_and(|byte| byte & mask != 0)
    }

    /// Whether the `width`-byte range holding `sequence`, aligned the way
    /// [`encode`] splits the bit array, has any bit set. Ranges are only
    /// ever written whole, so every bit of such a range is final.
    pub fn range_is_written(&self, sequence: u64, width: usize) -> bool {
        let width = width.max(1);
        let (_, idx) = mask_and_index(sequence);
        let start = idx / width * width;
        let end = (start + width).min(self.bits.len());
        self.bits
            .get(start..end)
            .is_some_and(|bytes| bytes.iter().any(|&b| b != 0))
    }

    /// Whether the bytes of `range` are already in place.
    pub fn contains(&self, range: &ByteRange) -> bool {
        let start = range.start_byte as usize;
        self.bits.get(start..start + range.bytes.len()) == Some(&range.bytes[..])
    }

    /// Overwrite the bytes covered by `range`, keeping the set bit counter
    /// in step. Returns the new counter value.
    pub fn apply(&mut self, range: &ByteRange) -> Result<u64, BitmapError> {
        let start = range.start_byte as usize;
        let end = start + range.bytes.len();
        let Some(target) = self.bits.get_mut(start..end) else {
            return Err(BitmapError::OutOfBounds {
                start_byte: range.start_byte,
                len: range.bytes.len(),
                capacity: self.bits.len(),
            });
        };
        let removed = count_ones(target);
        target.copy_from_slice(&range.bytes);
        self.header.ones = (self.header.ones + range.ones())
            .checked_sub(removed)
            .ok_or(BitmapError::OnesOverflow)?;
        Ok(self.header.ones)
    }
}
