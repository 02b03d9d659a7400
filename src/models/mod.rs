//! Core data models for the ephemeral object store.
//!
//! Persisted entities only; transient upload-session state lives in
//! `services::session` and is never serialized.

pub mod object;
