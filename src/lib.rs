//! # Vector Sync
//!
//! Incremental synchronization of a local record dataset with a remote
//! vector index.
//!
//! Vector Sync compares an NDJSON dataset against what a vector index holds,
//! writes the differences to a change ledger, and applies that ledger by
//! embedding the changed records and issuing batched upserts and deletes.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────┐
//! │  Dataset  │──▶│  Detect  │──▶│   Ledger    │──▶│  Apply   │
//! │  (NDJSON) │   │ enumerate│   │ ID,Action + │   │ embed +  │
//! └───────────┘   │ + fetch  │   │  manifest   │   │ upsert / │
//!                 └────┬─────┘   └─────────────┘   │  delete  │
//!                      │                           └────┬─────┘
//!                      ▼                                ▼
//!                 ┌──────────────────────────────────────────┐
//!                 │     VectorIndex (Pinecone / local)       │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vsync detect                  # write ./data/changes.csv
//! vsync apply --dry-run         # see what would be sent
//! vsync apply                   # embed and upsert/delete
//! vsync sync                    # both in one go
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`dataset`] | NDJSON dataset loader |
//! | [`enumerate`] | Remote id enumeration (list / query) |
//! | [`detect`] | Change detection |
//! | [`apply`] | Ledger application |
//! | [`pool`] | Bounded worker pool and cancellation |
//! | [`retry`] | Exponential backoff |
//! | [`http`] | HTTP status → error mapping |
//! | [`index`] | Pinecone and local index backends |
//! | [`embedding`] | OpenAI, Ollama, and hash embedders |
//! | [`progress`] | Progress reporting on stderr |
//! | [`sync_cmd`] | `detect` / `apply` / `sync` commands |
//! | [`stats`] | `stats` command |

pub mod apply;
pub mod config;
pub mod dataset;
pub mod detect;
pub mod embedding;
pub mod enumerate;
pub mod http;
pub mod index;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod stats;
pub mod sync_cmd;
