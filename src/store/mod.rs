//! Persistent Stores
//!
//! Two stores back long-term recall: a vector store for semantic queries
//! and a SQLite time-series store for metrics and event retention.

pub mod timeseries;
pub mod vector;

pub use timeseries::{
    LatestMetric, MetricBucket, MetricSample, MetricStats, ServiceStatusSample, TimeSeriesStore,
};
pub use vector::{Collection, Confidence, KnowledgeItem, SearchHit, VectorRecord, VectorStore};
