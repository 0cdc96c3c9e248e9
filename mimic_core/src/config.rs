use crate::alphabet::{
    AlphabetError, AlphabetPlan, DEFAULT_EXCLUDED, DEFAULT_FILLER, DEFAULT_FIRST, DEFAULT_LAST,
};
use crate::header::{Header, HeaderError, OBSERVED_HEADER_LEN};
use crate::mapper::{
    MapperError, OBSERVED_LEAD_OFFSETS, OBSERVED_LINEAR_BASE, OBSERVED_VERSION, PositionMapper,
};
use crate::oracle::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MIN_DELAY, DEFAULT_RETRY_BASE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    /// Base URL of the remote service. Only `build` and `verify` without a
    /// reference need it.
    pub endpoint: Option<String>,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Static query pairs sent with every request.
    #[serde(default)]
    pub extra_query: BTreeMap<String, String>,
}

fn default_query_param() -> String {
    "text".to_string()
}

fn default_min_delay_ms() -> u64 {
    DEFAULT_MIN_DELAY.as_millis() as u64
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_base_ms() -> u64 {
    DEFAULT_RETRY_BASE.as_millis() as u64
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            query_param: default_query_param(),
            min_delay_ms: default_min_delay_ms(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            timeout_ms: default_timeout_ms(),
            extra_query: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
    pub max_queries: Option<u64>,
    #[serde(default)]
    pub recheck: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AlphabetSettings {
    #[serde(default = "default_first")]
    pub first: char,
    #[serde(default = "default_last")]
    pub last: char,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<char>,
    #[serde(default = "default_filler")]
    pub filler: char,
}

fn default_first() -> char {
    DEFAULT_FIRST
}

fn default_last() -> char {
    DEFAULT_LAST
}

fn default_exclude() -> Vec<char> {
    DEFAULT_EXCLUDED.to_vec()
}

fn default_filler() -> char {
    DEFAULT_FILLER
}

impl AlphabetSettings {
    pub fn plan(&self) -> Result<AlphabetPlan, AlphabetError> {
        AlphabetPlan::from_range(self.first, self.last, &self.exclude, self.filler)
    }
}

impl Default for AlphabetSettings {
    fn default() -> Self {
        Self {
            first: default_first(),
            last: default_last(),
            exclude: default_exclude(),
            filler: default_filler(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TableSettings {
    #[serde(default = "default_table_path")]
    pub path: PathBuf,
    #[serde(default = "default_header_len")]
    pub header_len: usize,
    /// Expected header. When unset, the first response's header is captured.
    pub header_hex: Option<String>,
}

pub fn default_table_path() -> PathBuf {
    PathBuf::from("mimic_table.txt")
}

fn default_header_len() -> usize {
    OBSERVED_HEADER_LEN
}

impl TableSettings {
    pub fn header(&self) -> Result<Option<Header>, HeaderError> {
        self.header_hex.as_deref().map(Header::from_hex).transpose()
    }
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            path: default_table_path(),
            header_len: default_header_len(),
            header_hex: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MapperSettings {
    #[serde(default = "default_mapper_version")]
    pub version: String,
    #[serde(default = "default_lead_offsets")]
    pub lead_offsets: Vec<usize>,
    #[serde(default = "default_linear_base")]
    pub linear_base: usize,
}

fn default_mapper_version() -> String {
    OBSERVED_VERSION.to_string()
}

fn default_lead_offsets() -> Vec<usize> {
    OBSERVED_LEAD_OFFSETS.to_vec()
}

fn default_linear_base() -> usize {
    OBSERVED_LINEAR_BASE
}

impl MapperSettings {
    pub fn mapper(&self) -> Result<PositionMapper, MapperError> {
        PositionMapper::new(
            self.version.as_str(),
            self.lead_offsets.clone(),
            self.linear_base,
        )
    }
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            version: default_mapper_version(),
            lead_offsets: default_lead_offsets(),
            linear_base: default_linear_base(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MimicConfig {
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub alphabet: AlphabetSettings,
    #[serde(default)]
    pub table: TableSettings,
    #[serde(default)]
    pub mapper: MapperSettings,
}

impl MimicConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_gives_observed_defaults() {
        let config = MimicConfig::from_toml("").unwrap();
        assert!(config.oracle.endpoint.is_none());
        assert_eq!(config.oracle.query_param, "text");
        assert_eq!(config.oracle.min_delay_ms, 50);
        assert_eq!(config.table.header_len, 21);
        assert_eq!(config.table.path, PathBuf::from("mimic_table.txt"));
        assert_eq!(config.mapper.mapper().unwrap(), PositionMapper::observed());
        assert_eq!(config.alphabet.plan().unwrap(), AlphabetPlan::default());
        assert!(!config.build.recheck);
    }

    #[test]
    fn parses_every_section() {
        let config = MimicConfig::from_toml(
            r#"
            [oracle]
            endpoint = "http://localhost:8080/enc"
            query-param = "q"
            max-attempts = 2
            extra-query = { key = "k1" }

            [build]
            max-queries = 500
            recheck = true

            [alphabet]
            first = "a"
            last = "f"
            exclude = ["c"]
            filler = "b"

            [table]
            path = "tables/site.txt"
            header-hex = "0a0b"

            [mapper]
            version = "custom-2"
            lead-offsets = [0, 3]
            linear-base = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.oracle.endpoint.as_deref(), Some("http://localhost:8080/enc"));
        assert_eq!(config.oracle.max_attempts, 2);
        assert_eq!(config.oracle.extra_query.get("key").map(String::as_str), Some("k1"));
        assert_eq!(config.build.max_queries, Some(500));
        assert!(config.build.recheck);
        assert_eq!(config.alphabet.plan().unwrap().symbols(), ['a', 'b', 'd', 'e', 'f']);
        assert_eq!(config.table.header().unwrap().unwrap().as_bytes(), [0x0a, 0x0b]);
        let mapper = config.mapper.mapper().unwrap();
        assert_eq!(mapper.map(1), 3);
        assert_eq!(mapper.map(2), 8);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(MimicConfig::from_toml("[oracle]\nendpont = \"x\"\n").is_err());
        assert!(MimicConfig::from_toml("[nope]\n").is_err());
    }

    #[test]
    fn loads_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[table]\nheader-len = 16").unwrap();
        let config = MimicConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.table.header_len, 16);

        let missing = file.path().with_extension("missing");
        assert!(MimicConfig::load_from_file(&missing).is_err());
    }
}
