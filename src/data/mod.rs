//! Data collection boundary
//!
//! The learning loop consumes one aggregated [`CollectedRecord`] per cycle.
//! Concrete network connectors live outside this crate; they plug in through
//! the [`DataSource`] trait. A failing source is logged and skipped so one
//! bad upstream never aborts the whole collection call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::Result;

/// One aggregated payload of collected data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedRecord {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CollectedRecord {
    /// An empty record; cycles receiving one skip straight to the next sleep
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// True when there is no usable text
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Payload returned by one upstream source
#[derive(Debug, Clone)]
pub struct SourceData {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// One upstream data source
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Source name, used for logging and metadata
    fn name(&self) -> &str;

    /// Fetch one payload; errors here are absorbed by the collector
    async fn fetch(&self) -> Result<SourceData>;
}

/// Aggregates every registered source into one record per collection call
pub struct DataCollector {
    sources: Vec<Box<dyn DataSource>>,
}

impl DataCollector {
    pub fn new(sources: Vec<Box<dyn DataSource>>) -> Self {
        Self { sources }
    }

    /// A collector with no sources; every collection yields an empty record
    pub fn disconnected() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Pull from every source and merge the results
    ///
    /// A failing source is logged at warn and skipped; the call itself only
    /// ever succeeds, possibly with an empty record.
    pub async fn collect(&self) -> CollectedRecord {
        let mut record = CollectedRecord::empty();

        for source in &self.sources {
            match source.fetch().await {
                Ok(data) => {
                    if !data.text.is_empty() {
                        if !record.text.is_empty() {
                            record.text.push('\n');
                        }
                        record.text.push_str(&data.text);
                    }
                    record.metadata.extend(data.metadata);
                }
                Err(e) => {
                    warn!("Collection from source '{}' failed: {e}", source.name());
                }
            }
        }

        record.timestamp = Utc::now();
        record
    }
}

/// Source yielding a fixed payload; used by tests and the demo binary
pub struct StaticSource {
    name: String,
    text: String,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl DataSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<SourceData> {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), self.name.clone());
        Ok(SourceData {
            text: self.text.clone(),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionError;

    struct FailingSource;

    #[async_trait]
    impl DataSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch(&self) -> Result<SourceData> {
            Err(FusionError::Computation("upstream unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_collect_merges_sources() {
        let collector = DataCollector::new(vec![
            Box::new(StaticSource::new("alpha", "first payload")),
            Box::new(StaticSource::new("beta", "second payload")),
        ]);
        let record = collector.collect().await;
        assert!(record.text.contains("first payload"));
        assert!(record.text.contains("second payload"));
        assert!(!record.is_empty());
    }

    #[tokio::test]
    async fn test_failing_source_is_absorbed() {
        let collector = DataCollector::new(vec![
            Box::new(FailingSource),
            Box::new(StaticSource::new("alpha", "still here")),
        ]);
        let record = collector.collect().await;
        assert!(record.text.contains("still here"));
    }

    #[tokio::test]
    async fn test_disconnected_collector_yields_empty_record() {
        let collector = DataCollector::disconnected();
        let record = collector.collect().await;
        assert!(record.is_empty());
    }
}
