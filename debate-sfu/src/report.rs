//! Delivery of finished debate reports to the render pipeline
//!
//! ## Sinks
//!
//! - **Redis** (production): the JSON report is pushed onto the render list
//!   consumed by the renderer. This is a plain redis list of report
//!   documents, not a Bull job queue: a renderer built on Bull's `render`
//!   queue needs a small consumer that `BRPOP`s this list and enqueues.
//! - **Log**: the report is only logged; used when redis is not configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SfuError};
use crate::rule::RuleEntry;
use crate::types::{PeerId, RoomId};

/// Name of the render list under the configured key prefix
const RENDER_QUEUE: &str = "render";

/// One seated participant in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMember {
    pub id: PeerId,
    pub name: String,
    /// Seat key, e.g. `team_a_1`
    pub role: String,
    pub file_path: PathBuf,
    pub recorded: bool,
}

/// What the renderer needs once every recording of a debate has finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordReport {
    pub room_id: RoomId,
    pub global_id: Uuid,
    pub debate_name: String,
    pub description: String,
    pub team_size: usize,
    pub order_size: usize,
    pub members: Vec<ReportMember>,
    pub rules: Arc<[RuleEntry]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &RecordReport) -> Result<()>;
}

/// Pushes reports onto `<key_prefix>render`
///
/// Each list element is one [`RecordReport`] serialized as JSON, with no job
/// envelope. Consumers pop from the right for FIFO order.
pub struct RedisReportQueue {
    conn: redis::aio::ConnectionManager,
    key: String,
}

impl RedisReportQueue {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| SfuError::Report(format!("Invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| SfuError::Report(format!("Failed to connect to redis: {e}")))?;
        Ok(Self::new(conn, key_prefix))
    }

    #[must_use]
    pub fn new(conn: redis::aio::ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key: render_queue_key(key_prefix),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Redis list the reports are pushed to
#[must_use]
pub fn render_queue_key(key_prefix: &str) -> String {
    format!("{key_prefix}{RENDER_QUEUE}")
}

#[async_trait]
impl ReportSink for RedisReportQueue {
    async fn publish(&self, report: &RecordReport) -> Result<()> {
        let payload = serde_json::to_string(report).map_err(|e| SfuError::Report(e.to_string()))?;
        let mut conn = self.conn.clone();
        let len: i64 = conn
            .lpush(&self.key, payload)
            .await
            .map_err(|e| SfuError::Report(format!("Failed to enqueue report: {e}")))?;
        debug!(key = %self.key, queue_len = len, "Report enqueued");
        Ok(())
    }
}

/// Logs reports instead of delivering them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn publish(&self, report: &RecordReport) -> Result<()> {
        let recorded = report.members.iter().filter(|m| m.recorded).count();
        info!(
            room_id = %report.room_id,
            global_id = %report.global_id,
            members = report.members.len(),
            recorded,
            report = %serde_json::to_string(report).unwrap_or_default(),
            "Debate report ready"
        );
        Ok(())
    }
}
