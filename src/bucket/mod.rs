//! Bucket Store Module
//!
//! The storage node: a passive, digest-verified object store.
//!
//! ## Core Concepts
//! - **Verification**: every upload is rehashed with the same digest function
//!   the client used; only matching bytes are persisted.
//! - **Digest keying**: bytes are stored under their digest, not the lease,
//!   so identical content occupies one slot no matter who uploaded it.
//! - **Passivity**: capacity and quota accounting belong to the directory;
//!   the bucket only reports its usage and the verification verdict.

pub mod handlers;
pub mod protocol;
pub mod store;
