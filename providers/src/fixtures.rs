//! OpenPGP keys for tests. Never use them for anything else.

/// An unprotected ed25519 secret key, key id `5c67a598915e0513`.
pub const SIGNING_KEY: &str = include_str!("../testdata/signing.key.asc");

/// A passphrase protected ed25519 secret key, key id `13e0137b510fe9c4`.
pub const LOCKED_SIGNING_KEY: &str = include_str!("../testdata/locked-signing.key.asc");

pub const LOCKED_SIGNING_KEY_PASSPHRASE: &str = "correct horse";
