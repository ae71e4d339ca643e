//! # Vector Sync Core
//!
//! Runtime-free logic for Vector Sync: the record model, canonical text and
//! field stringification, change classification, the change ledger schema,
//! the error taxonomy, and the ports through which the sync engine reaches the
//! remote vector index and the embedding service.
//!
//! This crate contains no tokio, HTTP, or filesystem-walking code. The
//! `vector-sync` app crate provides the engine, the network adapters, and the
//! `vsync` CLI on top of it.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Records, remote items, change entries |
//! | [`classify`] | Per-record add/update/no-change decision |
//! | [`ledger`] | `ID,Action` CSV codec and the JSON manifest |
//! | [`error`] | Remote, integrity, and ledger errors |
//! | [`index`] | [`index::VectorIndex`] port and [`index::memory::InMemoryIndex`] |
//! | [`embedding`] | [`embedding::EmbeddingProvider`] port, hash embedder, vector math |

pub mod classify;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ledger;
pub mod models;
