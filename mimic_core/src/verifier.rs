use crate::encoder::{EncodeError, EncodedToken, Encoder, TokenError};
use crate::mapper::PositionMapper;
use crate::oracle::{Oracle, OracleError};
use crate::table::Table;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Cannot encode plaintext locally: {0}")]
    Encode(#[from] EncodeError),

    #[error("Reference token is unusable: {0}")]
    Reference(#[from] TokenError),

    #[error("Cannot fetch reference token: {0}")]
    Oracle(#[from] OracleError),
}

/// First decoded byte where the local token and the reference disagree.
/// `None` marks the side that ended before `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub index: usize,
    /// Byte of the reference token.
    pub expected: Option<u8>,
    /// Byte of the locally encoded token.
    pub actual: Option<u8>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |b: Option<u8>| b.map_or_else(|| "<end>".to_string(), |b| format!("{b:#04x}"));
        write!(
            f,
            "byte {}: expected {}, got {}",
            self.index,
            show(self.expected),
            show(self.actual)
        )
    }
}

/// Outcome of comparing one locally encoded token with a reference token.
/// Indexes refer to the decoded bytes, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub plaintext: String,
    pub encoded: EncodedToken,
    pub reference: EncodedToken,
    pub expected_len: usize,
    pub actual_len: usize,
    /// Bytes equal on both sides.
    pub matched: usize,
    /// The longer of the two lengths; a length difference counts against the match.
    pub compared: usize,
    pub first_mismatch: Option<Mismatch>,
    pub header_matches: bool,
    /// Plaintext positions whose mapped byte differs from the reference.
    pub mismatched_positions: Vec<usize>,
}

impl VerificationReport {
    pub fn match_percentage(&self) -> f64 {
        if self.compared == 0 {
            return 100.0;
        }
        self.matched as f64 * 100.0 / self.compared as f64
    }

    pub fn is_exact(&self) -> bool {
        self.first_mismatch.is_none()
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plaintext: {:?}", self.plaintext)?;
        writeln!(f, "encoded:   {}", self.encoded)?;
        writeln!(f, "reference: {}", self.reference)?;
        writeln!(
            f,
            "matched {}/{} bytes ({:.2}%), lengths {} local / {} reference",
            self.matched,
            self.compared,
            self.match_percentage(),
            self.actual_len,
            self.expected_len
        )?;
        writeln!(
            f,
            "header: {}",
            if self.header_matches { "ok" } else { "MISMATCH" }
        )?;
        if !self.mismatched_positions.is_empty() {
            writeln!(f, "mismatched positions: {:?}", self.mismatched_positions)?;
        }
        match &self.first_mismatch {
            Some(mismatch) => write!(f, "first mismatch at {mismatch}"),
            None => write!(f, "exact match"),
        }
    }
}

/// Certifies that a learned table reproduces the remote service.
#[derive(Debug, Clone, Copy)]
pub struct Verifier<'a> {
    encoder: Encoder<'a>,
}

impl<'a> Verifier<'a> {
    pub fn new(table: &'a Table, mapper: &'a PositionMapper) -> Self {
        Self {
            encoder: Encoder::new(table, mapper),
        }
    }

    /// Compares the local encoding of `plaintext` with an operator-captured `reference`.
    pub fn verify(
        &self,
        plaintext: &str,
        reference: &EncodedToken,
    ) -> Result<VerificationReport, VerifyError> {
        let actual = self.encoder.encode_bytes(plaintext)?;
        let expected = reference.decode()?;

        let compared = actual.len().max(expected.len());
        let mut matched = 0;
        let mut first_mismatch = None;
        for index in 0..compared {
            let (want, got) = (expected.get(index).copied(), actual.get(index).copied());
            if want == got {
                matched += 1;
            } else if first_mismatch.is_none() {
                first_mismatch = Some(Mismatch {
                    index,
                    expected: want,
                    actual: got,
                });
            }
        }

        // encode_bytes succeeded, so the table has a header.
        let header_len = self.encoder.table().header().map_or(0, |h| h.len());
        let header_matches =
            expected.len() >= header_len && actual[..header_len] == expected[..header_len];
        let mapper = self.encoder.mapper();
        let mismatched_positions = (0..plaintext.chars().count())
            .filter(|&position| {
                let offset = header_len + mapper.map(position);
                actual.get(offset) != expected.get(offset)
            })
            .collect();

        let report = VerificationReport {
            plaintext: plaintext.to_string(),
            encoded: EncodedToken::from_bytes(&actual),
            reference: EncodedToken::from_bytes(&expected),
            expected_len: expected.len(),
            actual_len: actual.len(),
            matched,
            compared,
            first_mismatch,
            header_matches,
            mismatched_positions,
        };
        debug!(
            plaintext,
            matched = report.matched,
            compared = report.compared,
            "Verified token"
        );
        Ok(report)
    }

    /// Fetches the reference for `plaintext` through `oracle`, then verifies.
    pub fn verify_live(
        &self,
        plaintext: &str,
        oracle: &mut dyn Oracle,
    ) -> Result<VerificationReport, VerifyError> {
        // Encode first so a plaintext the table cannot cover costs no query.
        self.encoder.encode_bytes(plaintext)?;
        let raw = oracle.call(plaintext)?;
        let reference = raw.parse::<EncodedToken>()?;
        info!(plaintext, "Fetched live reference token");
        self.verify(plaintext, &reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FnOracle, SimulatedOracle, learned_table};

    fn setup() -> (SimulatedOracle, PositionMapper, Table) {
        let oracle = SimulatedOracle::new();
        let mapper = PositionMapper::observed();
        let table = learned_table(&oracle, &mapper, 0..9, "abcdef");
        (oracle, mapper, table)
    }

    #[test]
    fn exact_match_against_simulated_service() {
        let (mut oracle, mapper, table) = setup();
        let verifier = Verifier::new(&table, &mapper);
        for plaintext in ["a", "fed", "abcdefabc"] {
            let report = verifier.verify_live(plaintext, &mut oracle).unwrap();
            assert!(report.is_exact(), "{report}");
            assert!(report.header_matches);
            assert!(report.mismatched_positions.is_empty());
            assert_eq!(report.match_percentage(), 100.0);
            assert_eq!(report.expected_len, report.actual_len);
        }
        assert_eq!(oracle.calls().last().map(String::as_str), Some("abcdefabc"));
    }

    #[test]
    fn trailer_shows_as_length_mismatch() {
        let (_, mapper, table) = setup();
        let oracle = SimulatedOracle::new().with_trailer(vec![9, 9]);
        let reference = EncodedToken::from_bytes(&oracle.cipher_bytes("abc"));

        let report = Verifier::new(&table, &mapper)
            .verify("abc", &reference)
            .unwrap();
        assert!(!report.is_exact());
        assert!(report.header_matches);
        assert!(report.mismatched_positions.is_empty());
        assert_eq!(report.expected_len, report.actual_len + 2);
        assert_eq!(report.matched, report.actual_len);
        assert_eq!(
            report.first_mismatch,
            Some(Mismatch {
                index: report.actual_len,
                expected: Some(9),
                actual: None,
            })
        );
        assert!(report.match_percentage() < 100.0);
    }

    #[test]
    fn corrupted_byte_is_located() {
        let (oracle, mapper, table) = setup();
        let mut bytes = oracle.cipher_bytes("cab");
        let offset = oracle.header().len() + mapper.map(1);
        let original = bytes[offset];
        bytes[offset] ^= 0x80;
        let reference = EncodedToken::from_bytes(&bytes);

        let report = Verifier::new(&table, &mapper)
            .verify("cab", &reference)
            .unwrap();
        assert_eq!(
            report.first_mismatch,
            Some(Mismatch {
                index: offset,
                expected: Some(original ^ 0x80),
                actual: Some(original),
            })
        );
        assert_eq!(report.mismatched_positions, vec![1]);
        assert_eq!(report.matched, report.compared - 1);
        assert!(report.to_string().contains("mismatched positions: [1]"));
    }

    #[test]
    fn header_difference_is_reported() {
        let (oracle, mapper, table) = setup();
        let mut bytes = oracle.cipher_bytes("ab");
        bytes[0] ^= 0x01;
        let report = Verifier::new(&table, &mapper)
            .verify("ab", &EncodedToken::from_bytes(&bytes))
            .unwrap();
        assert!(!report.header_matches);
        assert_eq!(report.first_mismatch.map(|m| m.index), Some(0));
    }

    #[test]
    fn unencodable_plaintext_makes_no_query() {
        let (_, mapper, table) = setup();
        let mut oracle = FnOracle::new(|_: &str| panic!("oracle must not be called"));
        let verifier = Verifier::new(&table, &mapper);
        assert!(matches!(
            verifier.verify_live("xyz", &mut oracle),
            Err(VerifyError::Encode(EncodeError::UnknownMapping { index: 0, .. }))
        ));

        let mut garbage = FnOracle::new(|_: &str| Ok("%%%".to_string()));
        assert!(matches!(
            verifier.verify_live("abc", &mut garbage),
            Err(VerifyError::Reference(_))
        ));
    }
}
