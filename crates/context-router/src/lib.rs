//! # Context Router
//!
//! **Agent-aware hybrid retrieval for AI coding assistants.**
//!
//! This crate is the application shell around [`context_router_core`]:
//! configuration, SQLite storage, embedding providers, a reference
//! ingestion command, the `ctxr` CLI, and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Files on   │──▶│ Route+Chunk  │──▶│  SQLite    │
//! │    disk     │   │   + Embed    │   │ FTS5 + Vec │
//! └─────────────┘   └──────────────┘   └─────┬─────┘
//!                                            │ ChunkStore
//!                                            ▼
//!                                   ┌─────────────────┐
//!                                   │  ContextRouter  │◀── profiles, model
//!                                   └───┬─────────┬───┘
//!                                       ▼         ▼
//!                                 ┌─────────┐ ┌──────────┐
//!                                 │   CLI   │ │   HTTP   │
//!                                 │ (ctxr)  │ │  (axum)  │
//!                                 └─────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ctxr init                                   # create database
//! ctxr ingest ./my-repo                       # route, chunk, embed, store
//! ctxr query "where is parse_config defined"  # classify, retrieve, rank
//! ctxr serve                                  # HTTP API + adaptation worker
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `ChunkStore` |
//! | [`state_store`] | Persisted profiles and model versions |
//! | [`embedding`] | Embedding provider selection and the OpenAI provider |
//! | [`runtime`] | Wires config, stores, and the router together |
//! | [`ingest`] | Reference ingestion pipeline |
//! | [`query`] | `query` and `classify` commands |
//! | [`inspect`] | `profiles`, `model`, and `stats` commands |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod inspect;
pub mod logging;
pub mod migrate;
pub mod query;
pub mod runtime;
pub mod server;
pub mod sqlite_store;
pub mod state_store;
