use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::crypto::KeyMaterial;
use crate::schema::{Column, DataType, TableSchema};

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_key_material() -> KeyMaterial {
    KeyMaterial {
        parts: [
            b"engine-a".to_vec(),
            b"engine-b".to_vec(),
            b"engine-c".to_vec(),
            b"engine-d".to_vec(),
        ],
        salt: b"engine_tests".to_vec(),
        iterations: 1_000, // keep tests fast; production uses 100k
    }
}

/// Standalone LSM-backed engine config rooted at `dir`.
pub fn lsm_config(dir: &Path) -> EngineConfig {
    init_tracing();
    EngineConfig {
        data_dir: dir.to_path_buf(),
        node_id: Some("test-node".to_string()),
        key_material: test_key_material(),
        ..EngineConfig::default()
    }
}

/// LSM config with a tiny memtable so segment flushes happen quickly.
pub fn small_memtable_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        memtable_entry_limit: 2,
        ..lsm_config(dir)
    }
}

/// Direct-flush engine config rooted at `dir`.
pub fn direct_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        use_direct_flush: true,
        ..lsm_config(dir)
    }
}

/// The standard test table: `t(id INT64 PK auto, name STRING, score INT32 indexed)`.
pub fn standard_schema() -> TableSchema {
    TableSchema::new(
        "t",
        vec![
            Column::new("id", DataType::Int64).primary_key().auto_increment(),
            Column::new("name", DataType::String),
            Column::new("score", DataType::Int32).indexed(),
        ],
        None,
    )
    .unwrap()
}

pub fn row(name: &str, score: i32) -> serde_json::Value {
    serde_json::json!({ "name": name, "score": score })
}
