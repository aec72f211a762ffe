//! Owner-side dispatch of inter-node requests.
//!
//! Every `Request` frame a peer sends lands here, keyed by its `action`
//! string. The handler executes the operation against the local engine and
//! returns the payload for the correlated response; errors travel back as
//! the response's error string, so a forwarding node surfaces this node's
//! message verbatim.

use async_trait::async_trait;

use crate::cluster::manager::DataHandler;
use crate::query::QueryBuilder;
use crate::schema::{Value, row_to_json};

use super::Engine;

/// Bridges the cluster layer's inbound requests to the engine.
pub struct EngineHandler {
    engine: Engine,
}

impl EngineHandler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    fn table_of(data: &serde_json::Value) -> Result<&str, String> {
        data.get("table")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "request is missing 'table'".to_string())
    }

    fn row_id_of(data: &serde_json::Value) -> Result<u64, String> {
        data.get("row_id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| "request is missing 'row_id'".to_string())
    }

    fn query_of(data: &serde_json::Value) -> Result<QueryBuilder, String> {
        let table = Self::table_of(data)?;
        let params = data.get("params").cloned().unwrap_or(serde_json::json!({}));
        QueryBuilder::from_params(table, &params).map_err(|err| err.to_string())
    }

    async fn run(&self, action: &str, data: serde_json::Value) -> Result<serde_json::Value, String> {
        match action {
            "ping" => Ok(serde_json::json!({ "pong": true })),

            "stats" => Ok(self.engine.stats().await),

            "insert" => {
                let table = Self::table_of(&data)?.to_string();
                let payload = data
                    .get("data")
                    .cloned()
                    .ok_or_else(|| "request is missing 'data'".to_string())?;
                let row_id = self
                    .engine
                    .insert(&table, payload, None)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::json!({ "row_id": row_id }))
            }

            "update" => {
                let table = Self::table_of(&data)?.to_string();
                let row_id = Self::row_id_of(&data)?;
                let payload = data
                    .get("data")
                    .cloned()
                    .ok_or_else(|| "request is missing 'data'".to_string())?;
                let updated = self
                    .engine
                    .update(&table, row_id, payload, None)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::json!({ "updated": updated }))
            }

            "delete" => {
                let table = Self::table_of(&data)?.to_string();
                let row_id = Self::row_id_of(&data)?;
                let deleted = self
                    .engine
                    .delete(&table, row_id, None)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::json!({ "deleted": deleted }))
            }

            "select" | "query" => {
                let query = Self::query_of(&data)?;
                let rows = self
                    .engine
                    .select(&query)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::Value::Array(
                    rows.iter().map(row_to_json).collect(),
                ))
            }

            "find_one" | "find_by_id" => {
                let table = Self::table_of(&data)?;
                let column = data
                    .get("column")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "request is missing 'column'".to_string())?;
                let value = data
                    .get("value")
                    .map(Value::from_json_untyped)
                    .ok_or_else(|| "request is missing 'value'".to_string())?;
                let row = self
                    .engine
                    .find_one(table, column, &value)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(row.map(|r| row_to_json(&r)).unwrap_or(serde_json::Value::Null))
            }

            "count" => {
                let query = Self::query_of(&data)?;
                let count = self
                    .engine
                    .count(query.table(), Some(&query))
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::json!({ "count": count }))
            }

            "exists" => {
                let query = Self::query_of(&data)?;
                let exists = self
                    .engine
                    .exists(query.table(), &query)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::json!({ "exists": exists }))
            }

            "fetch_guild_data" => {
                let table = Self::table_of(&data)?;
                let partition = data
                    .get("guild_id")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| "request is missing 'guild_id'".to_string())?;
                let rows = self
                    .engine
                    .partition_rows(table, partition)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::Value::Array(
                    rows.iter().map(row_to_json).collect(),
                ))
            }

            "write_data" => {
                let table = Self::table_of(&data)?.to_string();
                let payload = data
                    .get("data")
                    .cloned()
                    .ok_or_else(|| "request is missing 'data'".to_string())?;
                let row_id = self
                    .engine
                    .insert(&table, payload, None)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::json!({ "success": true, "row_id": row_id }))
            }

            "invalidate_cache" => {
                if let Some(table) = data.get("table").and_then(|v| v.as_str()) {
                    self.engine.invalidate_caches(table).await;
                }
                Ok(serde_json::json!({ "ok": true }))
            }

            other => Err(format!("unsupported action '{other}'")),
        }
    }
}

#[async_trait]
impl DataHandler for EngineHandler {
    async fn handle(
        &self,
        action: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        self.run(action, data).await
    }
}
