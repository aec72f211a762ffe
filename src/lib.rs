//! # coldb
//!
//! An embeddable, optionally distributed **columnar storage engine**:
//! writes buffer in memory and persist as immutable sorted segments on disk,
//! rows are encrypted at rest, and tables can be partitioned across a
//! cluster of peer nodes keyed by a tenant identifier.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │   ┌──────────┐   ┌───────────────┐   ┌───────────────────┐   │
//! │   │  Tables   │   │ Query engine  │   │   Transactions    │   │
//! │   │ (columnar │   │ + query cache │   │   (WAL-backed)    │   │
//! │   │  buffers) │   └───────────────┘   └───────────────────┘   │
//! │   └────┬─────┘                                               │
//! │        │ StorageBackend                                      │
//! │   ┌────┴───────────────┐      ┌───────────────────────────┐  │
//! │   │ LSM: memtable →    │  or  │ Direct flush: encrypted   │  │
//! │   │ SSTable + compact  │      │ micro-segment per write   │  │
//! │   └────────────────────┘      └───────────────────────────┘  │
//! │                                                              │
//! │   ┌──────────────────────────────────────────────────────┐   │
//! │   │ Cluster: hash ring · registry · client · dist. cache │   │
//! │   └──────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Public façade — tables, rows, queries, transactions, cluster |
//! | [`schema`] | Data types, values, columns, table schemas |
//! | [`codec`] | Binary value/column/table-file encoding with checksums |
//! | [`crypto`] | Authenticated row encryption (derived key, token framing) |
//! | [`skiplist`] | Ordered in-memory map backing the memtable |
//! | [`bloom`] | Negative membership test embedded in segments |
//! | [`memtable`] | Bounded write buffer with tombstones and lifecycle |
//! | [`wal`] | CRC-framed, fsync-first write-ahead log |
//! | [`txn`] | Transaction manager and crash recovery |
//! | [`sstable`] | Immutable sorted segment writer/reader |
//! | [`segment`] | Direct-flush micro-segment path |
//! | [`flush`] | Background memtable → segment drain |
//! | [`compaction`] | Leveled background segment merging |
//! | [`registry`] | Persistent segment metadata index |
//! | [`index`] | B-tree and hash column indexes |
//! | [`query`] | Query builder, predicate tree, execution |
//! | [`cache`] | Bounded LRU and query-result caches |
//! | [`table`] | Column-major table state and table files |
//! | [`cluster`] | Hash ring, membership, node client, fan-out reads |
//! | [`config`] | Engine constructor options |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use coldb::config::EngineConfig;
//! use coldb::engine::Engine;
//! use coldb::schema::{Column, DataType, TableSchema, Value};
//!
//! # async fn demo() -> Result<(), coldb::engine::EngineError> {
//! let config = EngineConfig {
//!     data_dir: "/tmp/coldb".into(),
//!     ..EngineConfig::default()
//! };
//! let engine = Engine::open(config).await?;
//!
//! let schema = TableSchema::new(
//!     "guild_settings",
//!     vec![
//!         Column::new("id", DataType::Int64).primary_key().auto_increment(),
//!         Column::new("guild_id", DataType::Int64).indexed(),
//!         Column::new("prefix", DataType::String),
//!     ],
//!     Some("guild_id".to_string()),
//! )?;
//! engine.create_table(schema, true).await?;
//!
//! let row_id = engine
//!     .insert(
//!         "guild_settings",
//!         serde_json::json!({ "guild_id": 1234, "prefix": "!" }),
//!         None,
//!     )
//!     .await?;
//!
//! let rows = engine
//!     .select(&engine.query("guild_settings").where_eq("guild_id", Value::Int64(1234)))
//!     .await?;
//! assert_eq!(rows.len(), 1);
//!
//! engine.delete("guild_settings", row_id, None).await?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod cache;
pub mod cluster;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod flush;
pub mod index;
pub mod memtable;
pub mod query;
pub mod registry;
pub mod schema;
pub mod segment;
pub mod skiplist;
pub mod sstable;
pub mod table;
pub mod txn;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use query::QueryBuilder;
pub use schema::{Column, DataType, Row, TableSchema, Value};
