use crate::alphabet::AlphabetPlan;
use crate::encoder::decode_token;
use crate::header::{Header, HeaderError, OBSERVED_HEADER_LEN};
use crate::mapper::PositionMapper;
use crate::oracle::{Oracle, OracleError};
use crate::store::{StoreError, TableStore};
use crate::table::{MapperStamp, TableError};
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures of a table build. Each variant carries enough context to diagnose
/// the problem without querying the oracle again. Nothing observed in a
/// failing probe is persisted.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Oracle failed at position {position} for {symbol:?}: {source}")]
    Oracle {
        position: usize,
        symbol: char,
        #[source]
        source: OracleError,
    },

    #[error(
        "Malformed token at position {position} for {symbol:?} ({raw_len} chars): {message}"
    )]
    MalformedToken {
        position: usize,
        symbol: char,
        raw_len: usize,
        message: String,
    },

    #[error("Header check failed at position {position} for {symbol:?} ({raw_len} raw chars): {source}")]
    Header {
        position: usize,
        symbol: char,
        raw_len: usize,
        #[source]
        source: HeaderError,
    },

    /// The mapped offset lies beyond the response; the mapper is wrong for this position.
    #[error(
        "Short response at position {position} for {symbol:?}: offset {offset} is beyond the \
         {tail_len}-byte tail ({raw_len} raw chars, {decoded_len} decoded bytes)"
    )]
    ShortResponse {
        position: usize,
        symbol: char,
        offset: usize,
        tail_len: usize,
        raw_len: usize,
        decoded_len: usize,
    },

    /// A fresh observation disagrees with the recorded byte.
    #[error(
        "Oracle is not deterministic at position {position} for {symbol:?}: recorded {recorded}, observed {observed}"
    )]
    Nondeterministic {
        position: usize,
        symbol: char,
        recorded: u8,
        observed: u8,
    },

    #[error("Table was built with mapper {recorded}, builder uses {offered}")]
    MapperMismatch { recorded: String, offered: String },

    #[error("Table header {recorded} differs from configured header {configured}")]
    HeaderConflict { recorded: String, configured: String },

    #[error("Table store failed: {0}")]
    Store(#[from] StoreError),
}

/// Knobs for a build run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Re-query entries that are already recorded and fail on any disagreement.
    pub recheck: bool,
    /// Stop cleanly once this many oracle calls have been made.
    pub max_queries: Option<u64>,
    /// Length of the header to capture when none is configured or recorded.
    pub header_len: usize,
    /// Expected header. When absent, the header of the first response is captured.
    pub header: Option<Header>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            recheck: false,
            max_queries: None,
            header_len: OBSERVED_HEADER_LEN,
            header: None,
        }
    }
}

/// Summary of one [`TableBuilder::build`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Positions whose every alphabet symbol is now recorded, in order.
    pub positions_completed: Vec<usize>,
    pub learned: usize,
    /// Entries already known and not re-queried.
    pub skipped: usize,
    /// Entries re-queried in recheck mode and found identical.
    pub rechecked: usize,
    pub frame_learned: usize,
    /// Frame bytes that differed from the recorded value. Frame bytes are
    /// assumed plaintext-independent; a non-zero count weakens that assumption.
    pub frame_disagreements: usize,
    pub queries: u64,
    /// The query budget ran out before the requested range was done.
    pub interrupted: bool,
}

/// Learns a [`crate::table::Table`] by probing an [`Oracle`].
///
/// For every position in the requested range, in order, and every symbol of
/// the alphabet, the builder sends the probe isolating that symbol, decodes
/// and validates the response, and records the byte found at the mapped
/// cipher offset through the injected [`TableStore`]. Entries already in the
/// store are not queried again, so an interrupted run resumes where it stopped.
pub struct TableBuilder<O: Oracle, S: TableStore> {
    oracle: O,
    store: S,
    mapper: PositionMapper,
    options: BuildOptions,
    queries: u64,
}

impl<O: Oracle, S: TableStore> TableBuilder<O, S> {
    pub fn new(oracle: O, store: S, mapper: PositionMapper, options: BuildOptions) -> Self {
        Self {
            oracle,
            store,
            mapper,
            options,
            queries: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mapper(&self) -> &PositionMapper {
        &self.mapper
    }

    pub fn into_parts(self) -> (O, S) {
        (self.oracle, self.store)
    }

    /// Learns every alphabet symbol at every position of `positions`.
    pub fn build(
        &mut self,
        positions: Range<usize>,
        alphabet: &AlphabetPlan,
    ) -> Result<BuildReport, BuildError> {
        self.prepare()?;
        let mut report = BuildReport::default();
        info!(
            from = positions.start,
            to = positions.end,
            symbols = alphabet.len(),
            recheck = self.options.recheck,
            "Starting table build"
        );

        for position in positions {
            let learned_before = report.learned;
            let frame_before = report.frame_learned;
            for &symbol in alphabet.symbols() {
                let recorded = self.store.table().get(position, symbol);
                if recorded.is_some() && !self.options.recheck {
                    report.skipped += 1;
                    continue;
                }
                if self
                    .options
                    .max_queries
                    .is_some_and(|budget| self.queries >= budget)
                {
                    info!(position, queries = self.queries, "Query budget reached, stopping");
                    report.interrupted = true;
                    return Ok(report);
                }

                let observed = self.probe(position, symbol, alphabet, &mut report)?;
                match recorded {
                    Some(recorded) if recorded != observed => {
                        return Err(BuildError::Nondeterministic {
                            position,
                            symbol,
                            recorded,
                            observed,
                        });
                    }
                    Some(_) => report.rechecked += 1,
                    None => {
                        self.store
                            .record_entry(position, symbol, observed)
                            .map_err(|e| nondeterminism(e, position, symbol))?;
                        report.learned += 1;
                        debug!(position, symbol = %symbol, byte = observed, "Learned entry");
                    }
                }
            }
            // Nothing new was recorded for a fully known position.
            if report.learned > learned_before || report.frame_learned > frame_before {
                self.store.checkpoint()?;
            }
            report.positions_completed.push(position);
            info!(
                position,
                offset = self.mapper.map(position),
                learned = report.learned - learned_before,
                total = self.store.table().entries_at(position).len(),
                "Position complete"
            );
        }
        info!(
            learned = report.learned,
            skipped = report.skipped,
            queries = report.queries,
            "Table build finished"
        );
        Ok(report)
    }

    /// Checks the table against this builder's mapper and configured header
    /// before any query is made, stamping whichever is missing.
    fn prepare(&mut self) -> Result<(), BuildError> {
        let stamp = MapperStamp::of(&self.mapper);
        match self.store.table().mapper() {
            Some(recorded) if *recorded != stamp => {
                return Err(BuildError::MapperMismatch {
                    recorded: recorded.to_string(),
                    offered: stamp.to_string(),
                });
            }
            Some(_) => {}
            None => {
                self.store.record_mapper(stamp)?;
            }
        }

        if let Some(configured) = self.options.header.clone() {
            match self.store.table().header() {
                Some(recorded) if *recorded != configured => {
                    return Err(BuildError::HeaderConflict {
                        recorded: recorded.to_hex(),
                        configured: configured.to_hex(),
                    });
                }
                Some(_) => {}
                None => {
                    self.store.record_header(configured)?;
                }
            }
        }
        Ok(())
    }

    /// Sends one probe and returns the byte at the position's cipher offset.
    fn probe(
        &mut self,
        position: usize,
        symbol: char,
        alphabet: &AlphabetPlan,
        report: &mut BuildReport,
    ) -> Result<u8, BuildError> {
        let probe = alphabet.probe(position, symbol);
        self.queries += 1;
        report.queries += 1;
        let raw = self
            .oracle
            .call(&probe)
            .map_err(|source| BuildError::Oracle {
                position,
                symbol,
                source,
            })?;
        let raw_len = raw.len();
        let decoded = decode_token(&raw).map_err(|e| BuildError::MalformedToken {
            position,
            symbol,
            raw_len,
            message: e.to_string(),
        })?;
        let header_error = |source| BuildError::Header {
            position,
            symbol,
            raw_len,
            source,
        };

        let header = match self.store.table().header() {
            Some(header) => header.clone(),
            None => {
                let captured =
                    Header::capture(&decoded, self.options.header_len).map_err(header_error)?;
                info!(header = %captured.to_hex(), "Captured response header");
                self.store.record_header(captured.clone())?;
                captured
            }
        };
        let tail = header.validate(&decoded).map_err(header_error)?;

        let offset = self.mapper.map(position);
        let byte = *tail.get(offset).ok_or(BuildError::ShortResponse {
            position,
            symbol,
            offset,
            tail_len: tail.len(),
            raw_len,
            decoded_len: decoded.len(),
        })?;

        let frame: Vec<usize> = self.mapper.frame_offsets(offset).collect();
        for frame_offset in frame {
            let seen = tail[frame_offset];
            match self.store.table().frame_byte(frame_offset) {
                None => {
                    self.store.record_frame(frame_offset, seen)?;
                    report.frame_learned += 1;
                }
                Some(recorded) if recorded != seen => {
                    report.frame_disagreements += 1;
                    warn!(
                        offset = frame_offset,
                        recorded,
                        seen,
                        probe = %probe,
                        "Frame byte differs from recorded value"
                    );
                }
                Some(_) => {}
            }
        }
        Ok(byte)
    }
}

fn nondeterminism(err: StoreError, position: usize, symbol: char) -> BuildError {
    match err {
        StoreError::Table(TableError::Conflict {
            recorded, observed, ..
        }) => BuildError::Nondeterministic {
            position,
            symbol,
            recorded,
            observed,
        },
        other => BuildError::Store(other),
    }
}
