use crate::{Error, Result, SnapshotRef, Snapshots};
use async_trait::async_trait;
use chrono::Utc;

/// Shell command templates for the snapshot subsystem. Placeholders
/// `{block}`, `{hash}` and `{name}` are substituted before execution.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Creates a snapshot, e.g. `zfs snapshot tank/graph@b{block}`.
    pub create: String,
    /// Rolls back to a snapshot, e.g. `zfs rollback -r tank/graph@b{block}`.
    pub rollback: String,
    /// Prints one `block hash [created-at]` line per snapshot.
    pub list: String,
    /// Clones a snapshot into a named dataset.
    pub clone: Option<String>,
    /// Run before a rollback to quiesce dependent services.
    pub stop_services: Option<String>,
    /// Run after a rollback to restart them.
    pub start_services: Option<String>,
}

/// Snapshot capability backed by out-of-process commands.
pub struct CommandSnapshots {
    cfg: CommandConfig,
}

impl CommandSnapshots {
    pub fn new(cfg: CommandConfig) -> Self {
        Self { cfg }
    }

    async fn run(&self, template: &str, block_num: u64, hash: &str, name: &str) -> Result<String> {
        let command = template
            .replace("{block}", &block_num.to_string())
            .replace("{hash}", hash)
            .replace("{name}", name);

        tracing::debug!(%command, "running snapshot command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .map_err(Error::Spawn)?;

        if !output.status.success() {
            return Err(Error::Command {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Snapshots for CommandSnapshots {
    #[tracing::instrument(skip(self))]
    async fn create_checkpoint(&self, block_num: u64, hash: &str) -> Result<SnapshotRef> {
        self.run(&self.cfg.create, block_num, hash, "").await?;
        Ok(SnapshotRef {
            block_num,
            hash: hash.to_string(),
            created_at: Some(Utc::now()),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn rollback_to_checkpoint(&self, block_num: u64) -> Result<u64> {
        let target = crate::latest_at_or_below(self, block_num)
            .await?
            .ok_or(Error::NoSnapshot(block_num))?;

        if let Some(stop) = &self.cfg.stop_services {
            self.run(stop, target.block_num, "", "").await?;
        }
        let rollback = self.run(&self.cfg.rollback, target.block_num, "", "").await;
        if let Some(start) = &self.cfg.start_services {
            // Services restart even when the rollback itself failed.
            self.run(start, target.block_num, "", "").await?;
        }
        rollback.map(|_| target.block_num)
    }

    async fn list(&self) -> Result<Vec<SnapshotRef>> {
        let stdout = self.run(&self.cfg.list, 0, "", "").await?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_listing_line)
            .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn clone_checkpoint(&self, block_num: u64, name: &str) -> Result<String> {
        let template = self
            .cfg
            .clone
            .as_deref()
            .ok_or_else(|| Error::NoSnapshot(block_num))?;
        self.run(template, block_num, "", name).await?;
        Ok(name.to_string())
    }
}

fn parse_listing_line(line: &str) -> Result<SnapshotRef> {
    let mut parts = line.split_whitespace();
    let block_num = parts
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::BadListing(line.to_string()))?;
    let hash = parts
        .next()
        .ok_or_else(|| Error::BadListing(line.to_string()))?
        .to_string();
    let created_at = parts.next().and_then(|ts| ts.parse().ok());

    Ok(SnapshotRef {
        block_num,
        hash,
        created_at,
    })
}
