//! # Context Router Core
//!
//! Agent-aware hybrid retrieval for AI coding assistants: the engine that
//! turns a query into ranked, context-sized results.
//!
//! This crate has no filesystem, SQL, or HTTP dependencies. Storage,
//! embedding backends, and transport live in the `context-router` app
//! crate and plug in through the [`store::ChunkStore`] and
//! [`embedding::EmbeddingProvider`] traits.
//!
//! ## Pipeline
//!
//! ```text
//!  Query ─▶ AgentClassifier ─▶ ProfileRegistry ─▶ HybridRetrievalEngine ─▶ ContextualRanker ─▶ response
//!                                                  ├─ vector search ─┐            ▲
//!                                                  └─ keyword search ┘            │
//!                                                                         ModelHandle (versioned)
//!                                                                                 ▲
//!  FeedbackEvent ─▶ FeedbackRecorder ─▶ AdaptationWorker (background) ────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `Query`, `Chunk`, `CandidateResult`, `FeedbackEvent` |
//! | [`error`] | The `RetrievalError` taxonomy |
//! | [`text`] | Keyword extraction and term sets |
//! | [`snapshot`] | Atomically swapped `Arc` snapshots |
//! | [`metrics`] | Observability sink (counters, timings) |
//! | [`profile`] | `AgentProfile` and the `ProfileRegistry` |
//! | [`classifier`] | Query → agent profile classification |
//! | [`chunk`] | Content-type router and chunking strategies |
//! | [`embedding`] | Embedding provider trait and vector helpers |
//! | [`store`] | `ChunkStore` trait and the in-memory store |
//! | [`retrieval`] | Concurrent vector + keyword retrieval and merge |
//! | [`ranker`] | Contextual ranking and the versioned ranking model |
//! | [`feedback`] | Feedback recording and the adaptation loop |
//! | [`pipeline`] | `ContextRouter`, wiring all stages together |

pub mod chunk;
pub mod classifier;
pub mod embedding;
pub mod error;
pub mod feedback;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod profile;
pub mod ranker;
pub mod retrieval;
pub mod snapshot;
pub mod store;
pub mod text;

pub use error::{RetrievalError, RetrievalResult};
pub use pipeline::{ContextRouter, RankedResponse};
