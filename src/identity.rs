//! Node identity and record signatures.
//!
//! Each node owns one ed25519 keypair.  The secret half lives in the key
//! file and never leaves the process; the public half, hex encoded, is the
//! node's fingerprint and doubles as the key every peer verifies its
//! records with.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::info;
use rand::rngs::OsRng;
use tempfile::NamedTempFile;

use crate::error::IdentityError;
use crate::types::{Record, SignedFields};

#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let fingerprint = hex::encode(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            fingerprint,
        }
    }

    /// Read the key file, or generate a key and write it if the file does
    /// not exist yet.  An existing but unreadable or malformed file is an
    /// error; it is never silently replaced.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(path, &contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path)?;
                info!(
                    "Generated new identity {} in {}",
                    identity.fingerprint,
                    path.display()
                );
                Ok(identity)
            }
            Err(source) => Err(IdentityError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, IdentityError> {
        let corrupt = |reason: String| IdentityError::CorruptKey {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = hex::decode(contents.trim()).map_err(|e| corrupt(e.to_string()))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupt(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&key)))
    }

    /// Write the secret key atomically, readable by the owner only.
    fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let io_err = |source: io::Error| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        };
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }
        tmp.write_all(hex::encode(self.signing_key.as_bytes()).as_bytes())
            .map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Build and sign a record published by this node.
    ///
    /// The timestamp is truncated to milliseconds, the precision it is
    /// signed and serialised with.
    pub fn sign_record(&self, hostname: &str, address: &str, now: DateTime<Utc>) -> Record {
        let timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        let mut record = Record {
            hostname: hostname.to_ascii_lowercase(),
            address: address.to_string(),
            timestamp,
            origin: self.fingerprint.clone(),
            signature: String::new(),
        };
        record.signature = self.sign(&payload(&record.signed_fields()));
        record
    }
}

fn payload(fields: &SignedFields<'_>) -> Vec<u8> {
    serde_json::to_vec(fields).expect("serializing signed fields never fails")
}

/// Check `signature` (hex) over `message` against the hex public key
/// `fingerprint`.  Anything malformed simply fails verification.
pub fn verify(message: &[u8], signature: &str, fingerprint: &str) -> bool {
    let Ok(key_bytes) = hex::decode(fingerprint) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

pub fn verify_record(record: &Record) -> bool {
    verify(
        &payload(&record.signed_fields()),
        &record.signature,
        &record.origin,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn signed_record_verifies() {
        let id = Identity::generate();
        let record = id.sign_record("alpha", "fd00::1", at(10));
        assert_eq!(record.origin, id.fingerprint());
        assert!(verify_record(&record));
    }

    #[test]
    fn any_field_change_breaks_signature() {
        let id = Identity::generate();
        let record = id.sign_record("alpha", "fd00::1", at(10));

        let mut changed = record.clone();
        changed.address = "fd00::2".into();
        assert!(!verify_record(&changed));

        let mut changed = record.clone();
        changed.hostname = "beta".into();
        assert!(!verify_record(&changed));

        let mut changed = record.clone();
        changed.timestamp = at(11);
        assert!(!verify_record(&changed));

        let mut changed = record;
        changed.origin = Identity::generate().fingerprint().to_string();
        assert!(!verify_record(&changed));
    }

    #[test]
    fn garbage_signature_fails_closed() {
        let id = Identity::generate();
        let mut record = id.sign_record("alpha", "fd00::1", at(10));
        record.signature = "zz".into();
        assert!(!verify_record(&record));
        record.origin = "not-hex".into();
        assert!(!verify_record(&record));
    }

    #[test]
    fn timestamp_truncated_to_millis() {
        let id = Identity::generate();
        let now = Utc.timestamp_opt(10, 123_456_789).unwrap();
        let record = id.sign_record("alpha", "fd00::1", now);
        assert_eq!(record.timestamp.timestamp_subsec_nanos(), 123_000_000);
        assert!(verify_record(&record));
    }

    #[test]
    fn load_or_create_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("key");

        let first = Identity::load_or_create(&path).unwrap();
        let second = Identity::load_or_create(&path).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_key_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, "deadbeef").unwrap();

        let err = Identity::load_or_create(&path).unwrap_err();
        assert!(matches!(err, IdentityError::CorruptKey { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "deadbeef");
    }
}
