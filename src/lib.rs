//! # docqa
//!
//! Document ingestion and grounded question answering.
//!
//! PDF and plain-text files are parsed (with an OCR fallback for scans), cut
//! into overlapping passages, embedded, and stored in a flat inner-product
//! index next to a parallel metadata file. Questions are embedded the same
//! way, matched against the index, and answered by a generative backend that
//! only sees the retrieved passages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌────────────────┐
//! │ extract  │──▶│  chunk  │──▶│ embedding │──▶│     index      │──▶ mirror (S3)
//! │ PDF/TXT  │   │ windows │   │ provider  │   │ vectors + meta │
//! └──────────┘   └─────────┘   └───────────┘   └───────┬────────┘
//!                                                      │ search
//!          ┌──────────┐    ┌──────────┐          ┌─────▼─────┐
//!          │   CLI    │───▶│ pipeline │─────────▶│ generate  │
//!          │ (docqa)  │    │ + jobs   │          │ + retry   │
//!          └──────────┘    └────▲─────┘          └───────────┘
//!                               │
//!                          ┌────┴─────┐
//!                          │  server  │
//!                          │  (HTTP)  │
//!                          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docqa ingest ./handbook.pdf
//! docqa ask "What is the refund policy?"
//! docqa serve                   # POST /upload, GET /status/{id}, POST /ask
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error type |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF/TXT text extraction with OCR fallback |
//! | [`chunk`] | Overlapping text windows |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Persistent vector index and passage metadata |
//! | [`mirror`] | Best-effort remote copy of the index |
//! | [`jobs`] | Background ingestion job tracking |
//! | [`generate`] | Answer synthesis with retry and fallback |
//! | [`metrics`] | JSON-lines operation log |
//! | [`pipeline`] | Ingest / ask orchestration |
//! | [`server`] | HTTP API |
//! | [`stats`] | Index overview |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod jobs;
pub mod metrics;
pub mod mirror;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod stats;
