//! Supabase/PostgREST backend over `reqwest`.
//!
//! The hosted realtime channel is a separate websocket protocol; this backend
//! only echoes its own successful writes into the change feed, which is enough
//! for a single session to observe what it persisted.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ChangeCallback, ChangeEvent, ChangeFeed, ChangeKind, DataStore, Filter, Row, StoreError, SubscriptionHandle};

const fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PostgrestConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    /// Anon or service key; sent as both `apikey` and bearer token.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

pub struct PostgrestStore {
    client: Client,
    base: Url,
    api_key: String,
    feed: ChangeFeed,
}

impl PostgrestStore {
    pub fn new(cfg: &PostgrestConfig) -> Result<Self, StoreError> {
        let mut root = cfg.url.trim_end_matches('/').to_owned();
        root.push_str("/rest/v1/");
        let base = Url::parse(&root).map_err(|e| StoreError::Url(format!("{}: {e}", cfg.url)))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms.max(1)))
            .build()
            .map_err(|e| StoreError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base,
            api_key: cfg.api_key.clone(),
            feed: ChangeFeed::default(),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        self.base
            .join(table)
            .map_err(|e| StoreError::Url(format!("{table}: {e}")))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn send(req: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let resp = req.send().await.map_err(|e| StoreError::Http(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode_rows(resp: reqwest::Response) -> Result<Vec<Row>, StoreError> {
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let value: Value = resp.json().await.map_err(|e| StoreError::Decode(e.to_string()))?;
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            Value::Object(map) => Ok(vec![map]),
            other => Err(StoreError::Decode(format!("expected rows, got {other}"))),
        }
    }

    fn publish(&self, table: &str, kind: ChangeKind, rows: Vec<Row>) {
        for row in rows {
            self.feed.publish(ChangeEvent {
                table: table.to_owned(),
                kind,
                row,
            });
        }
    }
}

/// PostgREST query pairs for `filter` (`col=eq.value`, `order`, `limit`).
pub fn query_pairs(filter: &Filter) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = filter
        .eq
        .iter()
        .map(|(col, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (col.clone(), format!("eq.{rendered}"))
        })
        .collect();
    if let Some(col) = &filter.order_desc {
        pairs.push(("order".into(), format!("{col}.desc")));
    }
    if let Some(limit) = filter.limit {
        pairs.push(("limit".into(), limit.to_string()));
    }
    pairs
}

#[async_trait]
impl DataStore for PostgrestStore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let url = self.table_url(table)?;
        let req = self
            .authed(self.client.get(url))
            .query(&[("select", "*")])
            .query(&query_pairs(filter));
        let resp = Self::send(req).await?;
        Self::decode_rows(resp).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<(), StoreError> {
        let url = self.table_url(table)?;
        let req = self
            .authed(self.client.post(url))
            .header("Prefer", "return=minimal")
            .json(&row);
        Self::send(req).await?;
        debug!(table, "row inserted");
        self.publish(table, ChangeKind::Insert, vec![row]);
        Ok(())
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        let url = self.table_url(table)?;
        let req = self
            .authed(self.client.patch(url))
            .header("Prefer", "return=representation")
            .query(&query_pairs(filter))
            .json(&patch);
        let resp = Self::send(req).await?;
        let rows = Self::decode_rows(resp).await?;
        let count = rows.len();
        self.publish(table, ChangeKind::Update, rows);
        Ok(count)
    }

    async fn upsert(&self, table: &str, row: Row, conflict_key: &str) -> Result<(), StoreError> {
        if !row.contains_key(conflict_key) {
            return Err(StoreError::MissingConflictKey(conflict_key.to_owned()));
        }
        let url = self.table_url(table)?;
        let req = self
            .authed(self.client.post(url))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", conflict_key)])
            .json(&row);
        Self::send(req).await?;
        self.publish(table, ChangeKind::Update, vec![row]);
        Ok(())
    }

    fn subscribe(&self, table: &str, kinds: &[ChangeKind], callback: ChangeCallback) -> SubscriptionHandle {
        self.feed.subscribe(table, kinds, callback)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.feed.unsubscribe(handle)
    }

    fn unsubscribe_all(&self) {
        self.feed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_postgrest_filters() {
        let filter = Filter::new()
            .eq("node_id", "node_1")
            .eq("block_index", 3)
            .order_desc("timestamp")
            .limit(10);
        assert_eq!(
            query_pairs(&filter),
            vec![
                ("node_id".to_string(), "eq.node_1".to_string()),
                ("block_index".to_string(), "eq.3".to_string()),
                ("order".to_string(), "timestamp.desc".to_string()),
                ("limit".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn builds_rest_base_url() {
        let store = PostgrestStore::new(&PostgrestConfig {
            url: "https://demo.supabase.co/".into(),
            api_key: "anon".into(),
            request_timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(
            store.table_url("nodes").unwrap().as_str(),
            "https://demo.supabase.co/rest/v1/nodes"
        );
    }

    #[test]
    fn rejects_malformed_url() {
        let err = PostgrestStore::new(&PostgrestConfig {
            url: "not a url".into(),
            api_key: String::new(),
            request_timeout_ms: 1_000,
        })
        .err()
        .unwrap();
        assert!(matches!(err, StoreError::Url(_)));
    }

    #[tokio::test]
    async fn upsert_checks_conflict_key_before_network() {
        let store = PostgrestStore::new(&PostgrestConfig {
            url: "http://127.0.0.1:9".into(),
            api_key: String::new(),
            request_timeout_ms: 100,
        })
        .unwrap();
        let err = store.upsert("nodes", Row::new(), "node_id").await.unwrap_err();
        assert!(matches!(err, StoreError::MissingConflictKey(_)));
    }
}
