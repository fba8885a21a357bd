//! # nodestore
//!
//! Transactional key-value persistence layer for a blockchain node:
//! - One contract ([`Db`]) for every backend and cache layer
//! - Unique-key tables and ordered duplicate-key tables
//! - Single-transaction begin/commit/abort semantics everywhere
//! - Crash-safe memory-mapped backend with snapshot readers
//! - Write-back, read and LRU cache layers that stack over any store
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Node subsystems                             │
//! │       (block indexing, wallet views, token metadata)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Db
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   Cache layers                               │
//! │      LruCache<D>  /  ReadCache<D>  /  WriteBackCache<D>      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Db
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  MappedDb   │          │ InMemoryDb  │
//!   │   (mmap)    │          │ (reference) │
//!   └──────┬──────┘          └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐
//!   │   data.db   │
//!   │ commit log  │
//!   └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod index;
pub mod db;

pub mod memory;
pub mod mapped;
pub mod cache;
pub mod stack;

mod overlay;
mod tables;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{CacheLimit, CompactionPolicy, Config, OpenMode, SyncStrategy};
pub use index::Index;
pub use db::{slice_value, Db, MultiMap, TransactionGuard, UniqueMap};
pub use memory::InMemoryDb;
pub use mapped::{MapStats, MappedDb, Recovery, RecoveryResult, Snapshot};
pub use cache::{LruCache, ReadCache, WriteBackCache};
pub use stack::{open_stack, StackKind};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of nodestore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
