use crate::mapper::PositionMapper;
use crate::table::{MapperStamp, Table};
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// URL-safe base64 without padding on output; accepts padded or unpadded input.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Token is not url-safe base64: {0}")]
pub struct TokenError(String);

/// Decodes a url-safe base64 token, with or without trailing `=` padding.
pub fn decode_token(raw: &str) -> Result<Vec<u8>, TokenError> {
    TOKEN_ENGINE
        .decode(raw.trim())
        .map_err(|e| TokenError(e.to_string()))
}

/// URL-safe, unpadded base64 text of `Header ++ CipherBytes`, as the remote
/// service emits it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedToken(String);

impl EncodedToken {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(TOKEN_ENGINE.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn decode(&self) -> Result<Vec<u8>, TokenError> {
        decode_token(&self.0)
    }
}

impl fmt::Display for EncodedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EncodedToken {
    type Err = TokenError;

    /// Accepts any decodable token and normalises it to the unpadded form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&decode_token(s)?))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Plaintext is empty")]
    EmptyPlaintext,

    /// The table has no positions far enough to cover the plaintext. Extend the table.
    #[error("Plaintext of {len} characters exceeds the {max} learned positions")]
    PlaintextTooLong { len: usize, max: usize },

    #[error("No learned byte for {symbol:?} at position {index}")]
    UnknownMapping { index: usize, symbol: char },

    #[error("No frame byte learned for cipher offset {offset}")]
    MissingFrame { offset: usize },

    #[error("Table has no header; build at least one entry first")]
    MissingHeader,

    #[error("Table was built with mapper {recorded}, encoder uses {offered}")]
    MapperMismatch { recorded: String, offered: String },
}

/// Replays a learned [`Table`] to produce tokens locally.
///
/// Encoding is pure: no I/O, and the same plaintext always yields the same
/// token. A missing table entry is an error, never a default byte.
#[derive(Debug, Clone, Copy)]
pub struct Encoder<'a> {
    table: &'a Table,
    mapper: &'a PositionMapper,
}

impl<'a> Encoder<'a> {
    pub fn new(table: &'a Table, mapper: &'a PositionMapper) -> Self {
        Self { table, mapper }
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }

    pub fn mapper(&self) -> &'a PositionMapper {
        self.mapper
    }

    /// Number of plaintext characters the table can encode.
    pub fn max_len(&self) -> usize {
        self.table.highest_position().map_or(0, |p| p + 1)
    }

    /// Decoded bytes of the token for `plaintext`: the header followed by a
    /// tail in which every plaintext position sits at its mapped offset and
    /// every other offset carries the learned frame byte.
    pub fn encode_bytes(&self, plaintext: &str) -> Result<Vec<u8>, EncodeError> {
        if plaintext.is_empty() {
            return Err(EncodeError::EmptyPlaintext);
        }
        if let Some(recorded) = self.table.mapper() {
            let offered = MapperStamp::of(self.mapper);
            if *recorded != offered {
                return Err(EncodeError::MapperMismatch {
                    recorded: recorded.to_string(),
                    offered: offered.to_string(),
                });
            }
        }
        let header = self.table.header().ok_or(EncodeError::MissingHeader)?;

        let len = plaintext.chars().count();
        let max = self.max_len();
        if len > max {
            return Err(EncodeError::PlaintextTooLong { len, max });
        }

        let mut tail: Vec<Option<u8>> = vec![None; self.mapper.tail_len(len)];
        for (index, symbol) in plaintext.chars().enumerate() {
            let byte = self
                .table
                .get(index, symbol)
                .ok_or(EncodeError::UnknownMapping { index, symbol })?;
            tail[self.mapper.map(index)] = Some(byte);
        }

        let mut bytes = Vec::with_capacity(header.len() + tail.len());
        bytes.extend_from_slice(header.as_bytes());
        for (offset, slot) in tail.into_iter().enumerate() {
            let byte = match slot {
                Some(byte) => byte,
                None => self
                    .table
                    .frame_byte(offset)
                    .ok_or(EncodeError::MissingFrame { offset })?,
            };
            bytes.push(byte);
        }
        Ok(bytes)
    }

    pub fn encode(&self, plaintext: &str) -> Result<EncodedToken, EncodeError> {
        self.encode_bytes(plaintext)
            .map(|bytes| EncodedToken::from_bytes(&bytes))
    }
}
