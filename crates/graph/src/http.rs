use crate::{BlockContext, Error, GraphStore, MutationBatch, Result};
use serde_json::{json, Value};
use url::Url;

/// Graph store reached over a JSON-over-HTTP mutation API.
#[derive(Clone)]
pub struct HttpGraph {
    http: reqwest::Client,
    base: Url,
}

impl HttpGraph {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = self
            .base
            .join(path)
            .map_err(|_| Error::InvalidEndpoint(self.base.to_string()))?;

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl GraphStore for HttpGraph {
    async fn query(&self, query: &str) -> Result<Value> {
        self.post("query", json!({"query": query})).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(block = ctx.block, replay = ctx.replay))]
    async fn write_batch(&self, batch: MutationBatch, ctx: &BlockContext) -> Result<()> {
        self.post(
            "mutate",
            json!({
                "sets": batch.sets,
                "deletes": batch.deletes,
                "context": ctx,
            }),
        )
        .await?;
        Ok(())
    }

    async fn alter(&self, schema: &str) -> Result<()> {
        self.post("alter", json!({"schema": schema})).await?;
        Ok(())
    }
}
