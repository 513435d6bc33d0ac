//! Elasticsearch `_bulk` client.

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::pusher::{IndexDocument, SearchClient};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`SearchClient`] that POSTs NDJSON to `{base_url}/_bulk`.
#[derive(Clone, Debug)]
pub struct ElasticsearchClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    basic_auth: Option<(String, String)>,
}

impl ElasticsearchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            basic_auth: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    fn bulk_url(&self) -> String {
        format!("{}/_bulk", self.base_url)
    }
}

/// NDJSON body for one bulk request: an `index` action line followed by
/// the document source, for each document.
pub fn bulk_body(index: &str, docs: &[IndexDocument]) -> anyhow::Result<String> {
    let mut body = String::new();
    for doc in docs {
        let action = match &doc.id {
            Some(id) => json!({ "index": { "_index": index, "_id": id } }),
            None => json!({ "index": { "_index": index } }),
        };
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&doc.body)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResponse {
    fn first_error(&self) -> Option<String> {
        self.items.iter().find_map(|item| {
            let result = item.as_object()?.values().next()?;
            let error = result.get("error")?;
            Some(
                error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            )
        })
    }
}

#[async_trait]
impl SearchClient for ElasticsearchClient {
    async fn bulk_write(
        &self,
        index: &str,
        docs: &[IndexDocument],
    ) -> anyhow::Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(self.bulk_url())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(index, docs)?);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("bulk request to {} failed", self.bulk_url()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("bulk write to {index} returned {status}: {text}"));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .context("unreadable bulk response")?;
        if parsed.errors {
            let reason = parsed
                .first_error()
                .unwrap_or_else(|| "unknown item error".to_string());
            return Err(anyhow!("bulk write to {index} rejected documents: {reason}"));
        }

        tracing::trace!(index, docs = docs.len(), "bulk write accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_body_pairs_action_and_source_lines() {
        let docs = vec![
            IndexDocument {
                id: Some("a.log#1".into()),
                body: json!({"status": 200}),
            },
            IndexDocument {
                id: None,
                body: json!({"status": 404}),
            },
        ];
        let body = bulk_body("logs-a", &docs).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["index"]["_index"], "logs-a");
        assert_eq!(lines[0]["index"]["_id"], "a.log#1");
        assert_eq!(lines[1]["status"], 200);
        assert!(lines[2]["index"].get("_id").is_none());
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_item_error_reason_is_extracted() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                {"index": {"status": 201}},
                {"index": {"status": 400, "error": {"type": "mapper_parsing_exception", "reason": "failed to parse field [status]"}}}
            ]
        }))
        .unwrap();
        assert_eq!(
            response.first_error().as_deref(),
            Some("failed to parse field [status]")
        );
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = ElasticsearchClient::new("http://localhost:9200/");
        assert_eq!(client.bulk_url(), "http://localhost:9200/_bulk");
    }
}
