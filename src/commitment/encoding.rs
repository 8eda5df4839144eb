//! 32-byte slot encoding used for hashing and for app attributes.
//!
//! Every static value occupies exactly one slot: integers are big-endian and
//! right aligned, as are addresses. Dynamic arrays and byte strings are written
//! as a length slot followed by their items (bytes padded to [SLOT_SIZE]).
//! There are no head/tail offsets, so the layout is easy to read back with a
//! [SlotReader].

use sha3::{
    digest::{core_api::CoreWrapper, Output},
    Digest, Keccak256, Keccak256Core,
};
use thiserror::Error;

use crate::types::{Address, Hash, U256};

pub const SLOT_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("slot value out of range for the target type")]
    ValueOutOfRange,
    #[error("trailing bytes after the encoded value")]
    TrailingBytes,
}

/// Sink for encoded slots.
pub trait Writer {
    /// Write a single slot. Callers always pass exactly [SLOT_SIZE] bytes.
    fn write(&mut self, slot: &[u8]);
}

impl Writer for Vec<u8> {
    fn write(&mut self, slot: &[u8]) {
        self.extend_from_slice(slot);
    }
}

pub struct Keccak256Writer {
    hasher: CoreWrapper<Keccak256Core>,
}

impl Default for Keccak256Writer {
    fn default() -> Self {
        Self {
            hasher: Keccak256::new(),
        }
    }
}

impl Writer for Keccak256Writer {
    fn write(&mut self, slot: &[u8]) {
        self.hasher.update(slot);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Output<Keccak256> {
        self.hasher.finalize()
    }
}

pub trait Encode {
    fn encode<W: Writer>(&self, w: &mut W);
}

impl Encode for U256 {
    fn encode<W: Writer>(&self, w: &mut W) {
        let mut slot = [0u8; SLOT_SIZE];
        self.to_big_endian(&mut slot);
        w.write(&slot);
    }
}

impl Encode for u64 {
    fn encode<W: Writer>(&self, w: &mut W) {
        U256::from(*self).encode(w)
    }
}

impl Encode for usize {
    fn encode<W: Writer>(&self, w: &mut W) {
        U256::from(*self).encode(w)
    }
}

impl Encode for Address {
    fn encode<W: Writer>(&self, w: &mut W) {
        // Addresses are right aligned (like uints), not left aligned like
        // fixed-size bytes.
        let mut slot = [0u8; SLOT_SIZE];
        slot[SLOT_SIZE - 20..].copy_from_slice(&self.0);
        w.write(&slot);
    }
}

impl Encode for Hash {
    fn encode<W: Writer>(&self, w: &mut W) {
        w.write(&self.0);
    }
}

impl<T: Encode> Encode for [T] {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.len().encode(w);
        for item in self {
            item.encode(w);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.as_slice().encode(w)
    }
}

/// A dynamic byte string.
pub struct Bytes<'a>(pub &'a [u8]);

impl Encode for Bytes<'_> {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.0.len().encode(w);
        for chunk in self.0.chunks(SLOT_SIZE) {
            let mut slot = [0u8; SLOT_SIZE];
            slot[..chunk.len()].copy_from_slice(chunk);
            w.write(&slot);
        }
    }
}

pub fn to_hash<T>(value: &T) -> Hash
where
    T: Encode + ?Sized,
{
    let mut writer = Keccak256Writer::default();
    value.encode(&mut writer);
    Hash(writer.finalize().into())
}

pub fn to_bytes<T>(value: &T) -> Vec<u8>
where
    T: Encode + ?Sized,
{
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Reads back values written by [Encode] implementations.
pub struct SlotReader<'a> {
    data: &'a [u8],
}

impl<'a> SlotReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn slot(&mut self) -> Result<&'a [u8], EncodingError> {
        if self.data.len() < SLOT_SIZE {
            return Err(EncodingError::UnexpectedEnd);
        }
        let (slot, rest) = self.data.split_at(SLOT_SIZE);
        self.data = rest;
        Ok(slot)
    }

    pub fn read_u256(&mut self) -> Result<U256, EncodingError> {
        Ok(U256::from_big_endian(self.slot()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, EncodingError> {
        let value = self.read_u256()?;
        if value > U256::from(u64::MAX) {
            return Err(EncodingError::ValueOutOfRange);
        }
        Ok(value.low_u64())
    }

    fn read_len(&mut self) -> Result<usize, EncodingError> {
        let len = self.read_u64()?;
        // Each item needs at least one slot, which bounds bogus lengths.
        let len = usize::try_from(len).map_err(|_| EncodingError::ValueOutOfRange)?;
        if len > self.data.len() / SLOT_SIZE {
            return Err(EncodingError::UnexpectedEnd);
        }
        Ok(len)
    }

    pub fn read_address(&mut self) -> Result<Address, EncodingError> {
        let slot = self.slot()?;
        if slot[..SLOT_SIZE - 20].iter().any(|b| *b != 0) {
            return Err(EncodingError::ValueOutOfRange);
        }
        let mut addr = Address::default();
        addr.0.copy_from_slice(&slot[SLOT_SIZE - 20..]);
        Ok(addr)
    }

    pub fn read_vec<T>(
        &mut self,
        mut read_item: impl FnMut(&mut Self) -> Result<T, EncodingError>,
    ) -> Result<Vec<T>, EncodingError> {
        let len = self.read_len()?;
        (0..len).map(|_| read_item(self)).collect()
    }

    pub fn finish(self) -> Result<(), EncodingError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(EncodingError::TrailingBytes)
        }
    }
}
