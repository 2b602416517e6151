//! Content-addressed storage for opaque large payloads.
//!
//! Blobs are stored as flat files named by the BLAKE3 hash of their bytes,
//! sharded into two-character hex prefix directories. Writes go through a
//! temporary file and an atomic rename; reads recompute the hash and fail on
//! divergence. Entries reference blobs by [`Cid`] inside their payloads; the
//! engine never interprets those references, so garbage collection takes the
//! referenced set from the caller.

mod cid;
mod store;

pub use self::cid::{Cid, InvalidCid};
pub use self::store::{BlobError, BlobStore};
