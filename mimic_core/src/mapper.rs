use thiserror::Error;

/// Cipher offsets observed for the first plaintext positions. Plaintext-derived
/// bytes are interleaved with other fixed-width content near the start of the
/// ciphertext, so these offsets are irregular.
pub const OBSERVED_LEAD_OFFSETS: [usize; 7] = [0, 7, 11, 13, 15, 17, 19];
/// Offset of the first position past the lead table; later positions are contiguous.
pub const OBSERVED_LINEAR_BASE: usize = 20;
/// Version tag of the mapping above. Bump it whenever the offsets are re-derived.
pub const OBSERVED_VERSION: &str = "observed-v1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MapperError {
    /// Lead offsets must strictly increase and stay below the linear base.
    #[error("Mapper offsets are not strictly increasing at position {position}")]
    NotMonotonic { position: usize },

    /// Versions are written into table files and may not contain whitespace.
    #[error("Mapper version {0:?} must be non-empty and free of whitespace")]
    InvalidVersion(String),
}

/// Maps a zero-based plaintext position to a byte offset in the ciphertext tail
/// (the decoded oracle response with the header stripped).
///
/// Positions covered by the lead table use their explicit offset; every later
/// position continues linearly from `linear_base`. The mapping is empirical
/// data, not a law: if the remote framing changes it has to be re-derived from
/// fresh samples and given a new version.
///
/// `map` is defined for positions up to `usize::MAX - linear_base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMapper {
    version: String,
    lead: Vec<usize>,
    linear_base: usize,
}

impl PositionMapper {
    /// The mapping observed for the current remote scheme.
    pub fn observed() -> Self {
        Self {
            version: OBSERVED_VERSION.to_string(),
            lead: OBSERVED_LEAD_OFFSETS.to_vec(),
            linear_base: OBSERVED_LINEAR_BASE,
        }
    }

    pub fn new(
        version: impl Into<String>,
        lead: Vec<usize>,
        linear_base: usize,
    ) -> Result<Self, MapperError> {
        let version = version.into();
        if version.is_empty() || version.chars().any(char::is_whitespace) {
            return Err(MapperError::InvalidVersion(version));
        }
        for position in 1..lead.len() {
            if lead[position] <= lead[position - 1] {
                return Err(MapperError::NotMonotonic { position });
            }
        }
        if let Some(&last) = lead.last() {
            if linear_base <= last {
                return Err(MapperError::NotMonotonic {
                    position: lead.len(),
                });
            }
        }
        Ok(Self {
            version,
            lead,
            linear_base,
        })
    }

    pub fn map(&self, position: usize) -> usize {
        match self.lead.get(position) {
            Some(&offset) => offset,
            None => self.linear_base + (position - self.lead.len()),
        }
    }

    /// Inverse of [`map`](Self::map): the position whose byte lands at `offset`, if any.
    pub fn position_of(&self, offset: usize) -> Option<usize> {
        if offset >= self.linear_base {
            return Some(self.lead.len() + (offset - self.linear_base));
        }
        self.lead.iter().position(|&lead| lead == offset)
    }

    pub fn is_mapped(&self, offset: usize) -> bool {
        self.position_of(offset).is_some()
    }

    /// Offsets below `upto` that no position maps to. These carry the
    /// interleaved frame content rather than plaintext-derived bytes.
    pub fn frame_offsets(&self, upto: usize) -> impl Iterator<Item = usize> + '_ {
        (0..upto).filter(move |&offset| !self.is_mapped(offset))
    }

    /// Tail length needed to hold a plaintext of `plaintext_len` characters.
    pub fn tail_len(&self, plaintext_len: usize) -> usize {
        match plaintext_len {
            0 => 0,
            len => self.map(len - 1) + 1,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn lead_offsets(&self) -> &[usize] {
        &self.lead
    }

    pub fn linear_base(&self) -> usize {
        self.linear_base
    }

    /// MD5 over the version and every offset parameter, as lowercase hex.
    /// Stored in each table so a table built under one mapping is never read
    /// through another.
    pub fn fingerprint(&self) -> String {
        let canonical = format!("{}|{:?}|{}", self.version, self.lead, self.linear_base);
        format!("{:x}", md5::compute(canonical.as_bytes()))
    }
}

impl Default for PositionMapper {
    fn default() -> Self {
        Self::observed()
    }
}
