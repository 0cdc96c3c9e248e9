use crate::header::Header;
use crate::mapper::PositionMapper;
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

/// Version written on the first line of every table file.
pub const TABLE_FORMAT_VERSION: u32 = 1;
const MAGIC_PREFIX: &str = "# mimic-table v";

/// Errors raised while mutating or parsing a [`Table`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    /// A second, different byte was offered for an existing (position, symbol) entry.
    #[error(
        "Conflicting entry at position {position} for {symbol:?}: recorded {recorded}, observed {observed}"
    )]
    Conflict {
        position: usize,
        symbol: char,
        recorded: u8,
        observed: u8,
    },

    #[error("Conflicting frame byte at offset {offset}: recorded {recorded}, observed {observed}")]
    FrameConflict {
        offset: usize,
        recorded: u8,
        observed: u8,
    },

    #[error("Table already carries header {recorded}, refusing {offered}")]
    HeaderConflict { recorded: String, offered: String },

    #[error("Table was built with mapper {recorded}, refusing {offered}")]
    MapperConflict { recorded: String, offered: String },

    /// Control characters would break the line-oriented text format.
    #[error("Symbol {0:?} cannot be stored in a table")]
    InvalidSymbol(char),

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
}

fn parse_error(line: usize, message: impl Into<String>) -> TableError {
    TableError::Parse {
        line,
        message: message.into(),
    }
}

/// Identifies the [`PositionMapper`] a table was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperStamp {
    pub version: String,
    pub fingerprint: String,
}

impl MapperStamp {
    pub fn of(mapper: &PositionMapper) -> Self {
        Self {
            version: mapper.version().to_string(),
            fingerprint: mapper.fingerprint(),
        }
    }
}

impl fmt::Display for MapperStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.version, self.fingerprint)
    }
}

/// The learned position → symbol → byte mapping, plus the metadata needed to
/// replay it: the response header, the mapper stamp and the frame bytes seen
/// at cipher offsets no position maps to.
///
/// Every part is append-only. Offering the value already recorded is a no-op;
/// offering a different one is an error and leaves the table untouched.
/// Symbols within a position keep the order in which they were learned, which
/// keeps the rendered text stable across load/save cycles.
///
/// Text form, one line per block:
///
/// ```text
/// # mimic-table v1
/// header: 0102...15
/// mapper: observed-v1 5f0c...
/// frame: {1:12, 2:200}
/// 0: {a:17, b:203}
/// 1: {a:5}
/// ```
///
/// A journal may repeat `frame:` and position lines; they are merged on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    header: Option<Header>,
    mapper: Option<MapperStamp>,
    frame: BTreeMap<usize, u8>,
    positions: BTreeMap<usize, Vec<(char, u8)>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: usize, symbol: char) -> Option<u8> {
        self.positions.get(&position).and_then(|entries| {
            entries
                .iter()
                .find(|(known, _)| *known == symbol)
                .map(|(_, byte)| *byte)
        })
    }

    pub fn contains(&self, position: usize, symbol: char) -> bool {
        self.get(position, symbol).is_some()
    }

    /// Entries learned at `position`, in learning order.
    pub fn entries_at(&self, position: usize) -> &[(char, u8)] {
        self.positions
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions.keys().copied()
    }

    pub fn highest_position(&self) -> Option<usize> {
        self.positions.keys().next_back().copied()
    }

    pub fn entry_count(&self) -> usize {
        self.positions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Returns `Ok(true)` if the entry is new, `Ok(false)` if the same byte is
    /// already recorded, and an error if a different byte is.
    pub fn check_entry(&self, position: usize, symbol: char, byte: u8) -> Result<bool, TableError> {
        if symbol.is_control() {
            return Err(TableError::InvalidSymbol(symbol));
        }
        match self.get(position, symbol) {
            None => Ok(true),
            Some(recorded) if recorded == byte => Ok(false),
            Some(recorded) => Err(TableError::Conflict {
                position,
                symbol,
                recorded,
                observed: byte,
            }),
        }
    }

    pub fn insert(&mut self, position: usize, symbol: char, byte: u8) -> Result<bool, TableError> {
        let fresh = self.check_entry(position, symbol, byte)?;
        if fresh {
            self.positions
                .entry(position)
                .or_default()
                .push((symbol, byte));
        }
        Ok(fresh)
    }

    pub fn frame_byte(&self, offset: usize) -> Option<u8> {
        self.frame.get(&offset).copied()
    }

    pub fn frame(&self) -> &BTreeMap<usize, u8> {
        &self.frame
    }

    pub fn check_frame(&self, offset: usize, byte: u8) -> Result<bool, TableError> {
        match self.frame_byte(offset) {
            None => Ok(true),
            Some(recorded) if recorded == byte => Ok(false),
            Some(recorded) => Err(TableError::FrameConflict {
                offset,
                recorded,
                observed: byte,
            }),
        }
    }

    pub fn insert_frame(&mut self, offset: usize, byte: u8) -> Result<bool, TableError> {
        let fresh = self.check_frame(offset, byte)?;
        if fresh {
            self.frame.insert(offset, byte);
        }
        Ok(fresh)
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn check_header(&self, header: &Header) -> Result<bool, TableError> {
        match &self.header {
            None => Ok(true),
            Some(recorded) if recorded == header => Ok(false),
            Some(recorded) => Err(TableError::HeaderConflict {
                recorded: recorded.to_hex(),
                offered: header.to_hex(),
            }),
        }
    }

    pub fn set_header(&mut self, header: Header) -> Result<bool, TableError> {
        let fresh = self.check_header(&header)?;
        if fresh {
            self.header = Some(header);
        }
        Ok(fresh)
    }

    pub fn mapper(&self) -> Option<&MapperStamp> {
        self.mapper.as_ref()
    }

    pub fn check_mapper(&self, stamp: &MapperStamp) -> Result<bool, TableError> {
        match &self.mapper {
            None => Ok(true),
            Some(recorded) if recorded == stamp => Ok(false),
            Some(recorded) => Err(TableError::MapperConflict {
                recorded: recorded.to_string(),
                offered: stamp.to_string(),
            }),
        }
    }

    pub fn set_mapper(&mut self, stamp: MapperStamp) -> Result<bool, TableError> {
        let fresh = self.check_mapper(&stamp)?;
        if fresh {
            self.mapper = Some(stamp);
        }
        Ok(fresh)
    }

    /// Canonical text form: one block per position, positions ascending.
    pub fn render(&self) -> String {
        let mut out = magic_line();
        if let Some(header) = &self.header {
            out.push_str(&header_line(header));
        }
        if let Some(stamp) = &self.mapper {
            out.push_str(&mapper_line(stamp));
        }
        if !self.frame.is_empty() {
            let body: Vec<String> = self
                .frame
                .iter()
                .map(|(offset, byte)| format!("{offset}:{byte}"))
                .collect();
            out.push_str(&format!("frame: {{{}}}\n", body.join(", ")));
        }
        for (position, entries) in &self.positions {
            let body: Vec<String> = entries
                .iter()
                .map(|(symbol, byte)| format!("{symbol}:{byte}"))
                .collect();
            out.push_str(&format!("{position}: {{{}}}\n", body.join(", ")));
        }
        out
    }

    /// Parses canonical text or an append-only journal of the same syntax.
    /// Empty input yields an empty table.
    pub fn parse(text: &str) -> Result<Self, TableError> {
        let mut table = Table::new();
        let mut lines = text.lines().enumerate();
        match lines.next() {
            None => return Ok(table),
            Some((_, first)) => check_magic(first)?,
        }

        for (index, line) in lines {
            let number = index + 1;
            if line.is_empty() {
                continue;
            }
            let (key, body) = line
                .split_once(": ")
                .ok_or_else(|| parse_error(number, "expected `<key>: <value>`"))?;
            let merged = |result: Result<bool, TableError>| {
                result
                    .map(|_| ())
                    .map_err(|e| parse_error(number, e.to_string()))
            };
            match key {
                "header" => {
                    let header =
                        Header::from_hex(body).map_err(|e| parse_error(number, e.to_string()))?;
                    merged(table.set_header(header))?;
                }
                "mapper" => {
                    let (version, fingerprint) = body
                        .split_once(' ')
                        .filter(|(v, f)| !v.is_empty() && !f.is_empty() && !f.contains(' '))
                        .ok_or_else(|| {
                            parse_error(number, "expected `mapper: <version> <fingerprint>`")
                        })?;
                    merged(table.set_mapper(MapperStamp {
                        version: version.to_string(),
                        fingerprint: fingerprint.to_string(),
                    }))?;
                }
                "frame" => {
                    let mut block = Block::open(body, number)?;
                    loop {
                        let offset = block.number()?;
                        block.expect(':')?;
                        let byte = block.byte()?;
                        merged(table.insert_frame(offset, byte))?;
                        if !block.next_entry()? {
                            break;
                        }
                    }
                }
                _ if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) => {
                    let position: usize = key
                        .parse()
                        .map_err(|_| parse_error(number, format!("position {key} out of range")))?;
                    let mut block = Block::open(body, number)?;
                    loop {
                        let symbol = block.symbol()?;
                        block.expect(':')?;
                        let byte = block.byte()?;
                        merged(table.insert(position, symbol, byte))?;
                        if !block.next_entry()? {
                            break;
                        }
                    }
                }
                other => return Err(parse_error(number, format!("unknown key {other:?}"))),
            }
        }
        Ok(table)
    }
}

pub(crate) fn magic_line() -> String {
    format!("{MAGIC_PREFIX}{TABLE_FORMAT_VERSION}\n")
}

pub(crate) fn header_line(header: &Header) -> String {
    format!("header: {}\n", header.to_hex())
}

pub(crate) fn mapper_line(stamp: &MapperStamp) -> String {
    format!("mapper: {stamp}\n")
}

pub(crate) fn entry_line(position: usize, symbol: char, byte: u8) -> String {
    format!("{position}: {{{symbol}:{byte}}}\n")
}

pub(crate) fn frame_line(offset: usize, byte: u8) -> String {
    format!("frame: {{{offset}:{byte}}}\n")
}

fn check_magic(line: &str) -> Result<(), TableError> {
    let version = line
        .strip_prefix(MAGIC_PREFIX)
        .ok_or_else(|| parse_error(1, "missing table format line"))?;
    match version.parse::<u32>() {
        Ok(TABLE_FORMAT_VERSION) => Ok(()),
        _ => Err(parse_error(
            1,
            format!("unsupported table format version {version:?}"),
        )),
    }
}

/// Cursor over a `{key:byte, key:byte}` block.
struct Block<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Block<'a> {
    fn open(body: &'a str, line: usize) -> Result<Self, TableError> {
        if body == "{}" {
            return Err(parse_error(line, "empty block"));
        }
        let mut block = Self {
            chars: body.chars().peekable(),
            line,
        };
        block.expect('{')?;
        Ok(block)
    }

    fn expect(&mut self, want: char) -> Result<(), TableError> {
        match self.chars.next() {
            Some(found) if found == want => Ok(()),
            Some(found) => Err(parse_error(
                self.line,
                format!("expected {want:?}, found {found:?}"),
            )),
            None => Err(parse_error(
                self.line,
                format!("line ended where {want:?} was expected"),
            )),
        }
    }

    fn symbol(&mut self) -> Result<char, TableError> {
        self.chars
            .next()
            .ok_or_else(|| parse_error(self.line, "line ended where a symbol was expected"))
    }

    fn number(&mut self) -> Result<usize, TableError> {
        let mut digits = String::new();
        while let Some(&c) = self.chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            self.chars.next();
        }
        if digits.is_empty() {
            return Err(parse_error(self.line, "expected a number"));
        }
        digits
            .parse()
            .map_err(|_| parse_error(self.line, format!("number {digits} out of range")))
    }

    fn byte(&mut self) -> Result<u8, TableError> {
        let value = self.number()?;
        u8::try_from(value)
            .map_err(|_| parse_error(self.line, format!("byte value {value} out of range")))
    }

    /// Consumes the separator after an entry; `true` if another entry follows.
    fn next_entry(&mut self) -> Result<bool, TableError> {
        match self.chars.next() {
            Some(',') => {
                self.expect(' ')?;
                Ok(true)
            }
            Some('}') => match self.chars.next() {
                None => Ok(false),
                Some(extra) => Err(parse_error(
                    self.line,
                    format!("unexpected {extra:?} after block"),
                )),
            },
            Some(found) => Err(parse_error(
                self.line,
                format!("expected \", \" or '}}', found {found:?}"),
            )),
            None => Err(parse_error(self.line, "unterminated block")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        let mut table = Table::new();
        table
            .set_header(Header::new((0..21).collect()).unwrap())
            .unwrap();
        table
            .set_mapper(MapperStamp::of(&PositionMapper::observed()))
            .unwrap();
        table.insert_frame(2, 200).unwrap();
        table.insert_frame(1, 12).unwrap();
        table.insert(0, 'b', 203).unwrap();
        table.insert(0, 'a', 17).unwrap();
        table.insert(1, ':', 0).unwrap();
        table.insert(1, '}', 255).unwrap();
        table.insert(1, ',', 9).unwrap();
        table.insert(7, '{', 44).unwrap();
        table
    }

    #[test]
    fn insert_is_append_only() {
        let mut table = Table::new();
        assert_eq!(table.get(0, 'a'), None);
        assert_eq!(table.insert(0, 'a', 0), Ok(true));
        assert_eq!(table.get(0, 'a'), Some(0));
        assert_eq!(table.insert(0, 'a', 0), Ok(false));
        assert_eq!(
            table.insert(0, 'a', 1),
            Err(TableError::Conflict {
                position: 0,
                symbol: 'a',
                recorded: 0,
                observed: 1
            })
        );
        assert_eq!(table.get(0, 'a'), Some(0));
        assert_eq!(table.entry_count(), 1);
        assert_eq!(table.insert(0, '\n', 3), Err(TableError::InvalidSymbol('\n')));
    }

    #[test]
    fn metadata_is_append_only() {
        let mut table = Table::new();
        let header = Header::new(vec![1, 2, 3]).unwrap();
        assert_eq!(table.set_header(header.clone()), Ok(true));
        assert_eq!(table.set_header(header), Ok(false));
        assert!(matches!(
            table.set_header(Header::new(vec![9]).unwrap()),
            Err(TableError::HeaderConflict { .. })
        ));

        let stamp = MapperStamp::of(&PositionMapper::observed());
        assert_eq!(table.set_mapper(stamp.clone()), Ok(true));
        let other = MapperStamp::of(&PositionMapper::new("v2", vec![], 0).unwrap());
        assert!(matches!(
            table.set_mapper(other),
            Err(TableError::MapperConflict { .. })
        ));

        assert_eq!(table.insert_frame(4, 1), Ok(true));
        assert_eq!(
            table.insert_frame(4, 2),
            Err(TableError::FrameConflict {
                offset: 4,
                recorded: 1,
                observed: 2
            })
        );
    }

    #[test]
    fn render_is_canonical() {
        let table = sample_table();
        let fingerprint = PositionMapper::observed().fingerprint();
        let expected = format!(
            "# mimic-table v1\n\
             header: 000102030405060708090a0b0c0d0e0f1011121314\n\
             mapper: observed-v1 {fingerprint}\n\
             frame: {{1:12, 2:200}}\n\
             0: {{b:203, a:17}}\n\
             1: {{::0, }}:255, ,:9}}\n\
             7: {{{{:44}}\n"
        );
        assert_eq!(table.render(), expected);
    }

    #[test]
    fn text_round_trips() {
        let table = sample_table();
        let text = table.render();
        let parsed = Table::parse(&text).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(parsed.render(), text);
        assert_eq!(parsed.highest_position(), Some(7));
        assert_eq!(parsed.entries_at(1), &[(':', 0), ('}', 255), (',', 9)]);
        assert!(parsed.entries_at(3).is_empty());
    }

    #[test]
    fn journal_lines_merge() {
        let journal = "# mimic-table v1\n\
                       0: {a:1}\n\
                       frame: {3:7}\n\
                       0: {b:2}\n\
                       1: {a:3}\n\
                       0: {a:1}\n";
        let table = Table::parse(journal).unwrap();
        assert_eq!(table.entries_at(0), &[('a', 1), ('b', 2)]);
        assert_eq!(table.frame_byte(3), Some(7));
        assert_eq!(
            table.render(),
            "# mimic-table v1\nframe: {3:7}\n0: {a:1, b:2}\n1: {a:3}\n"
        );
    }

    #[test]
    fn parse_rejects_conflicts_and_garbage() {
        let conflict = "# mimic-table v1\n0: {a:1}\n0: {a:2}\n";
        assert!(matches!(
            Table::parse(conflict),
            Err(TableError::Parse { line: 3, .. })
        ));

        let cases = [
            ("0: {a:1}\n", 1),
            ("# mimic-table v2\n", 1),
            ("# mimic-table v1\n0: {a:256}\n", 2),
            ("# mimic-table v1\n0: {a:1\n", 2),
            ("# mimic-table v1\n0: {a:1,b:2}\n", 2),
            ("# mimic-table v1\n0: {}\n", 2),
            ("# mimic-table v1\nx: {a:1}\n", 2),
            ("# mimic-table v1\n0: {a:1} \n", 2),
            ("# mimic-table v1\nmapper: onlyversion\n", 2),
            ("# mimic-table v1\nheader: nothex\n", 2),
        ];
        for (text, line) in cases {
            match Table::parse(text) {
                Err(TableError::Parse { line: got, .. }) => {
                    assert_eq!(got, line, "wrong line for {text:?}")
                }
                other => panic!("expected parse error for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_input_is_empty_table() {
        let table = Table::parse("").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.highest_position(), None);
        assert_eq!(table.render(), "# mimic-table v1\n");
    }
}
