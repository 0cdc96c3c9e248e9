//! In-process stand-ins for the remote service, shared by the unit tests.

use crate::alphabet::AlphabetPlan;
use crate::builder::{BuildOptions, TableBuilder};
use crate::encoder::EncodedToken;
use crate::header::{Header, OBSERVED_HEADER_LEN};
use crate::mapper::PositionMapper;
use crate::oracle::{Oracle, OracleError};
use crate::store::InMemoryTableStore;
use crate::table::Table;
use std::ops::Range;

/// A deterministic positional substitution cipher framed the way the remote
/// service frames its output: constant header, plaintext bytes at mapped
/// offsets, constant frame bytes in the gaps, and an optional trailer.
#[derive(Debug, Clone)]
pub(crate) struct SimulatedOracle {
    header: Header,
    mapper: PositionMapper,
    trailer: Vec<u8>,
    calls: Vec<String>,
}

impl SimulatedOracle {
    pub(crate) fn new() -> Self {
        let header = (0..OBSERVED_HEADER_LEN as u8).map(|i| 0xA0 ^ i).collect();
        Self {
            header: Header::new(header).unwrap(),
            mapper: PositionMapper::observed(),
            trailer: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub(crate) fn with_trailer(mut self, trailer: Vec<u8>) -> Self {
        self.trailer = trailer;
        self
    }

    pub(crate) fn header(&self) -> &Header {
        &self.header
    }

    pub(crate) fn calls(&self) -> &[String] {
        &self.calls
    }

    pub(crate) fn substitution(position: usize, symbol: char) -> u8 {
        let mixed = (symbol as u32).wrapping_mul(31) ^ (position as u32).wrapping_mul(17);
        (mixed as u8) ^ 0x5A
    }

    pub(crate) fn frame(offset: usize) -> u8 {
        0xF0 ^ offset as u8
    }

    pub(crate) fn cipher_bytes(&self, plaintext: &str) -> Vec<u8> {
        let len = plaintext.chars().count();
        let mut tail: Vec<u8> = (0..self.mapper.tail_len(len)).map(Self::frame).collect();
        for (position, symbol) in plaintext.chars().enumerate() {
            tail[self.mapper.map(position)] = Self::substitution(position, symbol);
        }
        let mut bytes = self.header.as_bytes().to_vec();
        bytes.extend_from_slice(&tail);
        bytes.extend_from_slice(&self.trailer);
        bytes
    }

    pub(crate) fn token(&self, plaintext: &str) -> String {
        EncodedToken::from_bytes(&self.cipher_bytes(plaintext)).into_string()
    }
}

impl Oracle for SimulatedOracle {
    fn call(&mut self, plaintext: &str) -> Result<String, OracleError> {
        self.calls.push(plaintext.to_string());
        Ok(self.token(plaintext))
    }
}

/// An oracle backed by a closure, for scripting misbehaving responses.
pub(crate) struct FnOracle<F>(F);

impl<F> FnOracle<F>
where
    F: FnMut(&str) -> Result<String, OracleError>,
{
    pub(crate) fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Oracle for FnOracle<F>
where
    F: FnMut(&str) -> Result<String, OracleError>,
{
    fn call(&mut self, plaintext: &str) -> Result<String, OracleError> {
        (self.0)(plaintext)
    }
}

/// Builds a table for `symbols` over `positions` against a copy of `oracle`.
pub(crate) fn learned_table(
    oracle: &SimulatedOracle,
    mapper: &PositionMapper,
    positions: Range<usize>,
    symbols: &str,
) -> Table {
    let alphabet = AlphabetPlan::from_symbols(symbols.chars(), 'a').unwrap();
    let mut builder = TableBuilder::new(
        oracle.clone(),
        InMemoryTableStore::new(),
        mapper.clone(),
        BuildOptions::default(),
    );
    builder.build(positions, &alphabet).unwrap();
    let (_, store) = builder.into_parts();
    store.into_table()
}
