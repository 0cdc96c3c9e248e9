use thiserror::Error;

/// Header length observed on every decoded oracle response.
pub const OBSERVED_HEADER_LEN: usize = 21;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    /// The decoded response does not start with the expected preamble, or is
    /// too short to contain it. Usually an error page or a changed scheme.
    #[error("Header mismatch: expected {expected}, got {actual} ({decoded_len} decoded bytes)")]
    HeaderMismatch {
        expected: String,
        actual: String,
        decoded_len: usize,
    },

    #[error("Cannot capture a {header_len}-byte header from {decoded_len} decoded bytes")]
    TooShortToCapture {
        header_len: usize,
        decoded_len: usize,
    },

    #[error("Header must not be empty")]
    Empty,

    #[error("Header is not valid hex: {0}")]
    InvalidHex(String),
}

/// The constant preamble prefixed to every decoded oracle response. It acts as
/// an integrity tag: a response that does not carry it is never learned from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header(Vec<u8>);

impl Header {
    pub fn new(bytes: Vec<u8>) -> Result<Self, HeaderError> {
        if bytes.is_empty() {
            return Err(HeaderError::Empty);
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(text: &str) -> Result<Self, HeaderError> {
        let bytes = hex::decode(text.trim()).map_err(|e| HeaderError::InvalidHex(e.to_string()))?;
        Self::new(bytes)
    }

    /// Learns the header from the first `len` bytes of a decoded response.
    pub fn capture(decoded: &[u8], len: usize) -> Result<Self, HeaderError> {
        if len == 0 {
            return Err(HeaderError::Empty);
        }
        match decoded.get(..len) {
            Some(prefix) => Ok(Self(prefix.to_vec())),
            None => Err(HeaderError::TooShortToCapture {
                header_len: len,
                decoded_len: decoded.len(),
            }),
        }
    }

    /// Checks that `decoded` starts with this header and returns the tail that follows it.
    pub fn validate<'a>(&self, decoded: &'a [u8]) -> Result<&'a [u8], HeaderError> {
        match decoded.strip_prefix(self.0.as_slice()) {
            Some(tail) => Ok(tail),
            None => {
                let seen = &decoded[..decoded.len().min(self.0.len())];
                Err(HeaderError::HeaderMismatch {
                    expected: self.to_hex(),
                    actual: hex::encode(seen),
                    decoded_len: decoded.len(),
                })
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}
