mod access;
mod errors;
mod fingerprint;
mod system;

pub mod directives;
pub mod fixtures;
pub mod merge;
pub mod oracle;
pub mod postprocess;
pub mod profiles;
pub mod signing;
pub mod template;

pub use access::{find_protection, load_directory_tree};
pub use directives::{Directory, Protection, DIRECTORIES_FILE, PRIVATE_FILES, STAMP_FILE};
pub use errors::Error;
pub use fingerprint::{fingerprint, Fingerprint};
pub use oracle::{GitOracle, RevisionOracle, StaticOracle};
pub use profiles::Profiles;
pub use signing::SigningKey;
pub use system::{Actor, System, SystemConfig, STAGING_PREFIX};
pub use template::BaseUrl;

#[cfg(test)]
mod tests;
