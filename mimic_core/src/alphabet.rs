use thiserror::Error;

/// First symbol of the default probe range.
pub const DEFAULT_FIRST: char = '!';
/// Last symbol of the default probe range.
pub const DEFAULT_LAST: char = '~';
/// Symbols left out of the default range because they carry meaning inside a query string.
pub const DEFAULT_EXCLUDED: &[char] = &['#', '%', '&', '+', '=', '?'];
/// Symbol repeated in front of the target symbol when building a probe.
pub const DEFAULT_FILLER: char = 'a';

/// Errors raised while assembling an [`AlphabetPlan`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AlphabetError {
    /// `first` sorts after `last`.
    #[error("Alphabet range {first:?}..={last:?} is empty")]
    EmptyRange { first: char, last: char },

    /// Only printable, non-space ASCII may be probed.
    #[error("Symbol {0:?} is not printable ASCII")]
    NotPrintable(char),

    #[error("Symbol {0:?} appears more than once in the alphabet")]
    DuplicateSymbol(char),

    /// Every symbol of the range was excluded.
    #[error("Alphabet has no symbols left after exclusions")]
    NoSymbols,

    #[error("Filler symbol {0:?} is not usable in a probe")]
    UnusableFiller(char),
}

/// The ordered set of symbols attempted at every position, together with the
/// filler symbol used to pad a probe up to the position under test.
///
/// The order of `symbols` is the order in which a build queries the oracle.
/// Entries for different symbols are independent, so the order only affects
/// which symbol is learned first after an interruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphabetPlan {
    symbols: Vec<char>,
    filler: char,
}

impl AlphabetPlan {
    /// Builds a plan from the inclusive range `first..=last`, dropping every symbol in `excluded`.
    pub fn from_range(
        first: char,
        last: char,
        excluded: &[char],
        filler: char,
    ) -> Result<Self, AlphabetError> {
        if first > last {
            return Err(AlphabetError::EmptyRange { first, last });
        }
        let symbols: Vec<char> = (first..=last).filter(|c| !excluded.contains(c)).collect();
        Self::checked(symbols, filler, excluded)
    }

    /// Builds a plan from an explicit symbol list, kept in the given order.
    pub fn from_symbols<It>(symbols: It, filler: char) -> Result<Self, AlphabetError>
    where
        It: IntoIterator<Item = char>,
    {
        Self::checked(symbols.into_iter().collect(), filler, DEFAULT_EXCLUDED)
    }

    fn checked(symbols: Vec<char>, filler: char, excluded: &[char]) -> Result<Self, AlphabetError> {
        if symbols.is_empty() {
            return Err(AlphabetError::NoSymbols);
        }
        for (index, symbol) in symbols.iter().enumerate() {
            if !symbol.is_ascii_graphic() {
                return Err(AlphabetError::NotPrintable(*symbol));
            }
            if symbols[..index].contains(symbol) {
                return Err(AlphabetError::DuplicateSymbol(*symbol));
            }
        }
        if !filler.is_ascii_graphic() || excluded.contains(&filler) {
            return Err(AlphabetError::UnusableFiller(filler));
        }
        Ok(Self { symbols, filler })
    }

    pub fn symbols(&self) -> &[char] {
        &self.symbols
    }

    pub fn filler(&self) -> char {
        self.filler
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn contains(&self, symbol: char) -> bool {
        self.symbols.contains(&symbol)
    }

    /// Returns the probe isolating `symbol` at `position`: `position` filler
    /// symbols followed by `symbol`.
    pub fn probe(&self, position: usize, symbol: char) -> String {
        let mut probe = String::with_capacity(position + 1);
        probe.extend(std::iter::repeat_n(self.filler, position));
        probe.push(symbol);
        probe
    }
}

impl Default for AlphabetPlan {
    fn default() -> Self {
        Self {
            symbols: (DEFAULT_FIRST..=DEFAULT_LAST)
                .filter(|c| !DEFAULT_EXCLUDED.contains(c))
                .collect(),
            filler: DEFAULT_FILLER,
        }
    }
}
