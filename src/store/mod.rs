//! The conversion store: durable, content-addressed pairs of blobs.
//!
//! Every record ([`CachedConversion`]) holds one representation in format A
//! and one in format B, each with its own digest. A lookup by *either* digest
//! returns the *other* side, so a document converted once can be served in
//! both directions afterwards.
//!
//! ## Invariants the implementations uphold
//!
//! - A record is written with both sides at once, or not at all.
//! - Stored digests are always the digests of the stored blobs; a mismatch
//!   on read is reported as [`StoreError::Corrupt`] and the bytes are not
//!   returned.
//! - A digest appears in at most one record. Inserting a pair whose source
//!   digest is already known is a no-op reported as
//!   [`InsertOutcome::AlreadyPresent`]. A pair whose source is new but whose
//!   target already belongs to another record is not written either; that
//!   is [`InsertOutcome::CounterpartOwned`].

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::fingerprint::Digest;
use crate::format::Side;
use async_trait::async_trait;
use bytes::Bytes;

/// One durable cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedConversion {
    pub id: i64,
    pub format_a_hash: Digest,
    pub format_a_blob: Bytes,
    pub format_b_hash: Digest,
    pub format_b_blob: Bytes,
    pub created_at: String,
}

impl CachedConversion {
    /// Check that both stored digests match their blobs.
    pub fn verify(&self) -> Result<(), StoreError> {
        for (side, hash, blob) in [
            ("format_a", &self.format_a_hash, &self.format_a_blob),
            ("format_b", &self.format_b_hash, &self.format_b_blob),
        ] {
            let actual = crate::fingerprint::digest(blob);
            if &actual != hash {
                return Err(StoreError::Corrupt {
                    id: self.id,
                    detail: format!(
                        "{side}_blob hashes to {} but {side}_hash is {}",
                        actual.short(),
                        hash.short()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Split the record around the side that matched `digest`.
    pub fn counterpart_of(&self, digest: &Digest) -> Option<Counterpart> {
        if digest == &self.format_a_hash {
            Some(Counterpart {
                record_id: self.id,
                side: Side::B,
                digest: self.format_b_hash,
                bytes: self.format_b_blob.clone(),
            })
        } else if digest == &self.format_b_hash {
            Some(Counterpart {
                record_id: self.id,
                side: Side::A,
                digest: self.format_a_hash,
                bytes: self.format_a_blob.clone(),
            })
        } else {
            None
        }
    }
}

/// The other half of a record, returned by a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterpart {
    pub record_id: i64,
    /// Side of the pair these bytes belong to.
    pub side: Side,
    pub digest: Digest,
    pub bytes: Bytes,
}

/// Result of [`ConversionStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The source digest is already in a record.
    AlreadyPresent,
    /// The source is new, but another record already holds the target
    /// digest (two inputs converted to identical bytes). Nothing was written.
    CounterpartOwned,
}

/// One side of a pending insert.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub digest: Digest,
    pub bytes: Bytes,
}

impl BlobEntry {
    pub fn new(digest: Digest, bytes: Bytes) -> Self {
        Self { digest, bytes }
    }
}

/// Persistent mapping from content digest to cached blob pairs.
///
/// Implementations must be safe to share across tasks: lookups run without
/// coordination, and concurrent inserts (same or different digests) must
/// resolve through the idempotence rule above.
#[async_trait]
pub trait ConversionStore: Send + Sync {
    /// Find the record containing `digest` on either side and return the
    /// opposite side. `Ok(None)` is a miss, not an error.
    async fn lookup(&self, digest: &Digest) -> Result<Option<Counterpart>, StoreError>;

    /// Atomically record a `source` ⇄ `target` pair. `source_is_format_a`
    /// says which column the source blob belongs in.
    async fn insert(
        &self,
        source: BlobEntry,
        target: BlobEntry,
        source_is_format_a: bool,
    ) -> Result<InsertOutcome, StoreError>;

    /// Number of records held.
    async fn len(&self) -> Result<u64, StoreError>;

    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
