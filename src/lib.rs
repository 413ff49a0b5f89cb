//! Personal rolodex: a knowledge graph of people, events and relationships
//! built up from narrated stories.
//!
//! The merge engine (`normalize`, `graph`, `merge`) is pure; everything else
//! is plumbing around it: gateways for transcription and extraction, a
//! snapshot store, and the session state machine that drives one story at a
//! time.

pub mod config;
pub mod extract;
pub mod graph;
pub mod logging;
pub mod manager;
pub mod merge;
pub mod normalize;
pub mod session;
pub mod storage;
pub mod transcribe;
