//! draftline: a durable chain-of-thought pipeline for content generation.
//!
//! A session walks N phases, each phase a THINK -> EXECUTE -> INTEGRATE
//! cycle. Every step result is persisted before the cursor moves, so any
//! process can crash at any point and a later `advance` resumes exactly
//! where the last commit left off. External work (LLM calls, searches) goes
//! through a persisted task queue drained by workers; a recovery sweep
//! re-drives anything that stops moving.

pub mod config;
pub mod drafts;
pub mod error;
pub mod http;
pub mod llm;
pub mod phase;
pub mod recovery;
pub mod session;
pub mod store;
pub mod strategies;
pub mod task;
pub mod worker;
