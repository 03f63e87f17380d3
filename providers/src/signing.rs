//! The process-wide OpenPGP signing key, read from an ASCII-armored secret
//! key, and the detached signatures made with it.

use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use pgp::composed::{Deserializable, Message, SignedSecretKey};
use pgp::crypto::hash::HashAlgorithm;
use pgp::types::*;
use rand::rngs::OsRng;

/// Extension of detached signature files and of the exported public key.
pub const SIGNATURE_EXTENSION: &str = "asc";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read signing key {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("invalid signing key: {0}")]
    InvalidKey(#[source] pgp::errors::Error),

    #[error("unable to unlock signing key: {0}")]
    Unlock(#[source] pgp::errors::Error),

    #[error("signing failed: {0}")]
    Sign(#[source] pgp::errors::Error),
}

pub struct SigningKey {
    secret_key: SignedSecretKey,
    passphrase: Option<String>,
    key_id: String,
    fingerprint: String,
    public_key_armored: String,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Parses an armored secret key. A protected key needs its passphrase,
    /// which is checked right away.
    pub fn parse(armored: &str, passphrase: Option<&str>) -> Result<Self, Error> {
        let (secret_key, _headers) =
            SignedSecretKey::from_string(armored).map_err(Error::InvalidKey)?;
        secret_key.verify().map_err(Error::InvalidKey)?;

        let passphrase = passphrase.filter(|p| !p.is_empty()).map(String::from);
        let pw = passphrase.clone().unwrap_or_default();
        let public_key = secret_key
            .public_key()
            .sign(&mut OsRng, &secret_key, || pw)
            .map_err(Error::Unlock)?;
        let public_key_armored = public_key
            .to_armored_string(Default::default())
            .map_err(Error::InvalidKey)?;

        Ok(Self {
            key_id: HEXLOWER.encode(secret_key.key_id().as_ref()),
            fingerprint: HEXLOWER.encode(secret_key.fingerprint().as_bytes()),
            public_key_armored,
            secret_key,
            passphrase,
        })
    }

    /// Reads and parses the armored secret key stored at `path`.
    pub async fn load(path: &Path, passphrase: Option<&str>) -> Result<Self, Error> {
        let armored = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Read(path.to_path_buf(), e))?;
        Self::parse(&armored, passphrase)
    }

    /// Lowercase hex of the 64 bit OpenPGP key id.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Lowercase hex of the OpenPGP fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// File name the public key is exported under.
    pub fn public_key_file_name(&self) -> String {
        format!("{}.{SIGNATURE_EXTENSION}", self.key_id)
    }

    /// Returns an ASCII-armored detached signature over `data`.
    pub fn sign_armored(&self, data: &[u8]) -> Result<String, Error> {
        let pw = self.passphrase.clone().unwrap_or_default();
        let message = Message::new_literal_bytes("", data)
            .sign(&mut OsRng, &self.secret_key, || pw, HashAlgorithm::SHA2_256)
            .map_err(Error::Sign)?;
        message
            .into_signature()
            .to_armored_string(Default::default())
            .map_err(Error::Sign)
    }

    pub fn public_key_armored(&self) -> &str {
        &self.public_key_armored
    }

    /// Writes the armored public key into `dir`, returning its path.
    pub fn write_public_key(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(self.public_key_file_name());
        std::fs::write(&path, &self.public_key_armored)?;
        Ok(path)
    }
}
