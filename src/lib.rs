//! Quarry - a logical dump engine for MySQL-compatible databases
//!
//! Quarry extracts schema and row data from a MySQL-protocol server
//! (MySQL, MariaDB or a TiDB-style distributed SQL engine) and writes
//! portable SQL artifacts to an external store, under a chosen consistency
//! discipline.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Dump Orchestrator                       │
//! │   (server probe, consistency, metadata, GC safepoint)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Chunker                              │
//! │  (region keys / sampled keys / integer ranges per table)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ bounded task queue
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Worker Pool                            │
//! │   (per-worker consistency-primed connection + writer)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    External Store                           │
//! │        (schema / data / metadata SQL artifacts)             │
//! └─────────────────────────────────────────────────────────────┘

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod conn;
pub mod consistency;
pub mod dump;
pub mod error;
pub mod metadata;
pub mod queue;
pub mod safepoint;
pub mod server;
pub mod sql;
pub mod storage;
pub mod task;
pub mod worker;
pub mod writer;

pub use config::{Config, Consistency};
pub use dump::Dumper;
pub use error::{QuarryError, Result};
