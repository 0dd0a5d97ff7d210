//! Integrity and provenance: content hashing and the install event log.

pub mod eventlog;
pub mod hasher;
