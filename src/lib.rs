//! Content-Addressed Storage Cluster Library
//!
//! This library crate defines the core modules that make up the storage system.
//! It serves as the foundation for the binary executable (`main.rs`), which can
//! run either node role.
//!
//! ## Architecture Modules
//! The system is composed of four loosely coupled subsystems:
//!
//! - **`digest`**: The content addressing primitive. A SHA-256 digest over an
//!   object's bytes is its identity everywhere in the cluster.
//! - **`directory`**: The index node. Authoritative digest -> bucket mapping,
//!   per-user quota and per-bucket capacity accounting, deduplication, and the
//!   lease lifecycle that keeps reservations from leaking capacity.
//! - **`bucket`**: The storage node. A passive object store that verifies
//!   uploaded bytes against their claimed digest and persists them keyed by
//!   digest, so identical content is stored once.
//! - **`client`**: The orchestrator external callers use. Drives the full
//!   digest -> allocate -> upload -> finalize sequence against the other nodes.

pub mod bucket;
pub mod client;
pub mod digest;
pub mod directory;
