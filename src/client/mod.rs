//! Client Orchestrator Module
//!
//! The smart client external callers use. It hides the cluster topology:
//! callers hand it bytes and a user id, it computes the digest, negotiates an
//! assignment with the index, uploads to the right bucket, and settles the
//! lease with the verification verdict.

pub mod orchestrator;
