use std::path::PathBuf;

use booksync_core::{parse_timestamp, RawRecord};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    /// Rate limiting or network trouble that outlived the transport's
    /// own retries. The cycle aborts without advancing sync state.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream rejected the request: {0}")]
    Upstream(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed dump payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// The external fetch capability: all records for an entity modified
/// after the cutoff, fully paginated by the implementation. Transport,
/// auth, and rate-limit backoff live behind this trait, not in the
/// core.
pub trait RecordFetcher {
    fn fetch(
        &self,
        entity: &str,
        since: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<Vec<RawRecord>, FetchError>> + Send;
}

/// Replays saved API dumps from a run directory: one `<entity>.json`
/// file per entity, each a JSON array of record objects. Used for
/// offline re-processing and as the test fetcher.
#[derive(Debug, Clone)]
pub struct DumpFetcher {
    dir: PathBuf,
}

impl DumpFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load(&self, entity: &str) -> Result<Vec<RawRecord>, FetchError> {
        let path = self.dir.join(format!("{entity}.json"));
        if !path.exists() {
            // A missing dump means no data for that entity in this run.
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        Ok(parsed
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

impl RecordFetcher for DumpFetcher {
    async fn fetch(
        &self,
        entity: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let records = self.load(entity)?;
        let Some(cutoff) = since else {
            return Ok(records);
        };
        Ok(records
            .into_iter()
            .filter(|record| match record_modified_at(record) {
                Some(modified) => modified > cutoff,
                // Records without a parseable timestamp are kept; the
                // upsert path is idempotent, so over-fetching is safe
                // and under-fetching is not.
                None => true,
            })
            .collect())
    }
}

fn record_modified_at(record: &RawRecord) -> Option<DateTime<Utc>> {
    ["last_modified_time", "updated_time", "created_time"]
        .iter()
        .find_map(|field| record.get(*field))
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp)
}
