use crate::batch::BatchSink;
use crate::error::AdapterError;
use crate::record::LogEvent;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::error::Error;

/// Configuration for [`ClickHouseSink`].
///
/// The sink talks to ClickHouse over HTTP using the `JSONEachRow` format.
/// It supports both dedicated-table per service and shared-table modes by
/// toggling the `service_name` field and selected table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClickHouseConfig {
    /// Base URL without query, e.g. "http://127.0.0.1:8123"
    pub url: String,
    pub database: String,
    pub table: String,
    pub service_name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            database: "default".to_string(),
            table: "logs".to_string(),
            service_name: None,
            user: None,
            password: None,
        }
    }
}

/// ClickHouse implementation of [`BatchSink`]; each batch is one
/// `INSERT ... FORMAT JSONEachRow` request. Wrap it in a
/// [`BatchingAdapter`](crate::batch::BatchingAdapter) to register it.
#[derive(Clone)]
pub struct ClickHouseSink {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig) -> Self {
        let client = Client::new();
        Self { client, config }
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    fn auth_query(&self) -> String {
        let mut query = String::new();
        if let Some(user) = &self.config.user {
            query.push_str(&format!("&user={}", urlencoding::encode(user)));
        }
        if let Some(password) = &self.config.password {
            query.push_str(&format!("&password={}", urlencoding::encode(password)));
        }
        query
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/?database={}&query=INSERT%20INTO%20{}%20FORMAT%20JSONEachRow{}",
            self.config.url,
            urlencoding::encode(&self.config.database),
            urlencoding::encode(&self.config.table),
            self.auth_query()
        )
    }

    fn map_event<'a>(&'a self, event: &'a LogEvent) -> ClickHouseRow<'a> {
        ClickHouseRow {
            timestamp: event.timestamp().to_rfc3339(),
            level: event.level().as_str(),
            logger: event.logger_name(),
            message: event.formatted_message(),
            thread: event.thread(),
            classification: event.classification(),
            tags: serde_json::to_string(event.context_tags()).unwrap_or_else(|_| "{}".to_string()),
            throwable: event.throwable().map(|t| t.to_string()),
            service_name: self.config.service_name.as_deref(),
        }
    }

    fn body(&self, batch: &[LogEvent]) -> Result<String, serde_json::Error> {
        let mut body = String::new();
        for event in batch {
            body.push_str(&serde_json::to_string(&self.map_event(event))?);
            body.push('\n');
        }
        Ok(body)
    }

    /// Validate that the target ClickHouse table exists. This is optional
    /// and is not called automatically.
    pub async fn validate_schema(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let query = format!(
            "query={}{}",
            urlencoding::encode(&format!(
                "DESCRIBE TABLE {}.{} FORMAT JSON",
                self.config.database, self.config.table
            )),
            self.auth_query()
        );

        let url = format!("{}/?{}", self.config.url, query);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(format!("ClickHouse schema validation failed with status {}", resp.status()).into());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ClickHouseRow<'a> {
    timestamp: String,
    level: &'a str,
    logger: &'a str,
    message: String,
    thread: Option<&'a str>,
    classification: &'a [String],
    tags: String,
    throwable: Option<String>,
    service_name: Option<&'a str>,
}

#[async_trait]
impl BatchSink for ClickHouseSink {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn write_batch(&self, _topic: &str, batch: &[LogEvent]) -> Result<(), AdapterError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = self.body(batch)?;
        let resp = self.client.post(self.endpoint()).body(body).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(format!("ClickHouse insert failed with status {}: {}", status, text).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;

    fn sink() -> ClickHouseSink {
        ClickHouseSink::new(ClickHouseConfig {
            user: Some("ops user".to_string()),
            service_name: Some("billing".to_string()),
            ..ClickHouseConfig::default()
        })
    }

    #[test]
    fn endpoint_encodes_credentials() {
        let endpoint = sink().endpoint();
        assert!(endpoint.starts_with("http://127.0.0.1:8123/?database=default&query=INSERT%20INTO%20logs"));
        assert!(endpoint.ends_with("&user=ops%20user"));
    }

    #[test]
    fn body_has_one_json_row_per_event() {
        let events: Vec<LogEvent> = (0..3)
            .map(|n| {
                LogEvent::builder(Level::Error, "billing::invoice")
                    .message("failed invoice {}")
                    .arg(n)
                    .tag("tenant", "t1")
                    .build()
                    .unwrap()
            })
            .collect();

        let body = sink().body(&events).unwrap();
        let rows: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["message"], "failed invoice 2");
        assert_eq!(rows[0]["level"], "ERROR");
        assert_eq!(rows[0]["service_name"], "billing");
        assert_eq!(rows[0]["tags"], "{\"tenant\":\"t1\"}");
    }
}
