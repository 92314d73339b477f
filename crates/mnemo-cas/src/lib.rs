//! Content-addressed blob store (CAS).
//!
//! Plaintext, uncompressed blobs keyed by their SHA-256 digest, laid out flat
//! under `<root>/content/<hex digest>` (no algorithm tag in the filename, no
//! directory sharding — §6's on-disk layout is bit-exact). Writes go through
//! write-temp-then-rename for atomicity. Store/delete on a single digest are
//! idempotent, so no locking is required: filenames are content-derived.
//!
//! Deliberately **not** encrypted or compressed at rest — §1 lists
//! content-at-rest encryption as a non-goal of the engine; callers who need
//! it should place the data directory on an encrypted filesystem. (Private
//! key material, not blob content, is what `mnemo-crypto`'s envelope
//! encrypts.)

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Maximum size of a single stored blob, per §4.2.
pub const MAX_BLOB_BYTES: usize = 1024 * 1024;

/// Errors produced by the content store.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying filesystem failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// `store` was called with a blob larger than [`MAX_BLOB_BYTES`].
    #[error("blob of {0} bytes exceeds the {MAX_BLOB_BYTES}-byte limit")]
    TooLarge(usize),
    /// [`ContentStore::get_verified`] recomputed the digest of the bytes on
    /// disk and it did not match the requested key. Distinct from a missing
    /// blob (`Ok(None)`) and from a generic I/O failure.
    #[error("content for digest {0} does not match its recomputed hash")]
    Tampered(String),
}

/// Outcome of [`ContentStore::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The blob is present and its digest matches.
    Ok,
    /// No file exists for this digest (consistent with redaction).
    Missing,
    /// A file exists but its recomputed digest does not match.
    Tampered,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of blob files currently stored.
    pub total_files: u64,
    /// Sum of all stored blobs' sizes in bytes.
    pub total_bytes: u64,
}

/// A flat, content-addressed blob store rooted at `<root>/content/`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    content_dir: PathBuf,
}

impl ContentStore {
    /// Open (creating if absent) a content store rooted at `data_dir`. The
    /// actual blobs live under `data_dir/content/`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let content_dir = data_dir.as_ref().join("content");
        fs::create_dir_all(&content_dir)?;
        Ok(Self { content_dir })
    }

    fn path_for(&self, digest_hex: &str) -> PathBuf {
        self.content_dir.join(digest_hex)
    }

    fn digest_hex(bytes: &[u8]) -> String {
        let tagged = mnemo_crypto::hash(bytes);
        tagged.strip_prefix("sha256:").expect("hash() always returns a sha256: tag").to_string()
    }

    /// Store `blob`, returning its tagged digest (`"sha256:<hex>"`).
    /// Idempotent: storing the same bytes twice leaves exactly one file.
    pub fn store(&self, blob: &[u8]) -> Result<String, Error> {
        if blob.len() > MAX_BLOB_BYTES {
            return Err(Error::TooLarge(blob.len()));
        }
        let hex = Self::digest_hex(blob);
        let final_path = self.path_for(&hex);
        if final_path.exists() {
            return Ok(format!("sha256:{hex}"));
        }
        let tmp_path = self.content_dir.join(format!(".{hex}.tmp"));
        fs::write(&tmp_path, blob)?;
        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                // Another writer may have raced us to the same content; that
                // is fine, the content is identical by construction.
                if !final_path.exists() {
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(format!("sha256:{hex}"))
    }

    /// Return the stored bytes for `digest`, or `None` if absent.
    pub fn get(&self, digest: &str) -> Result<Option<Vec<u8>>, Error> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        match fs::read(self.path_for(hex)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// As [`ContentStore::get`], but recompute the digest of the returned
    /// bytes and fail if it does not match `digest`.
    pub fn get_verified(&self, digest: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.get(digest)? {
            None => Ok(None),
            Some(bytes) => {
                let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
                if Self::digest_hex(&bytes) != hex {
                    return Err(Error::Tampered(digest.to_string()));
                }
                Ok(Some(bytes))
            }
        }
    }

    /// True if a blob for `digest` is present on disk.
    pub fn exists(&self, digest: &str) -> bool {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.path_for(hex).exists()
    }

    /// Remove the blob for `digest`, if present. Succeeds silently when
    /// already absent (used by redaction).
    pub fn delete(&self, digest: &str) -> Result<(), Error> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        match fs::remove_file(self.path_for(hex)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Check whether the blob for `digest` is present and, if so, whether
    /// its content matches. A missing blob is reported as `Missing`
    /// (compatible with redaction), not an error.
    pub fn verify(&self, digest: &str) -> Result<VerifyOutcome, Error> {
        match self.get(digest)? {
            None => Ok(VerifyOutcome::Missing),
            Some(bytes) => {
                let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
                if Self::digest_hex(&bytes) == hex {
                    Ok(VerifyOutcome::Ok)
                } else {
                    Ok(VerifyOutcome::Tampered)
                }
            }
        }
    }

    /// Aggregate file count and byte total across all stored blobs.
    pub fn stats(&self) -> Result<Stats, Error> {
        let mut total_files = 0u64;
        let mut total_bytes = 0u64;
        for entry in fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with('.') {
                continue; // in-flight temp file
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                total_files += 1;
                total_bytes += meta.len();
            }
        }
        Ok(Stats { total_files, total_bytes })
    }
}
