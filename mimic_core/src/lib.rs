pub mod alphabet;
pub mod builder;
pub mod config;
pub mod encoder;
pub mod header;
pub mod mapper;
pub mod oracle;
pub mod store;
pub mod table;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;

pub use alphabet::{AlphabetError, AlphabetPlan};
pub use builder::{BuildError, BuildOptions, BuildReport, TableBuilder};
pub use config::MimicConfig;
pub use encoder::{EncodeError, EncodedToken, Encoder};
pub use header::{Header, HeaderError};
pub use mapper::{MapperError, PositionMapper};
pub use oracle::{Endpoint, HttpEndpoint, Oracle, OracleClient, OracleError, RetryPolicy};
pub use store::{FileTableStore, InMemoryTableStore, StoreError, TableStore};
pub use table::{Table, TableError};
pub use verifier::{Mismatch, VerificationReport, Verifier, VerifyError};
