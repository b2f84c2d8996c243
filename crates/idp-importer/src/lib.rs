//! Importer pipeline for indicator and related-table data
//!
//! This crate is the batch data-ingestion core of IDP. It pulls external
//! tabular/geospatial sources (spreadsheets, SharePoint files, feature-service
//! APIs, SDMX feeds, vector layers, related tables), normalizes them into
//! typed records, and persists them with crash-resumable, idempotent
//! checkpointing.
//!
//! # Architecture
//!
//! - **config**: Importer definitions and engine tuning (`IMPORTER_*` env vars)
//! - **attrs**: Typed per-importer attributes validated against adapter schemas
//! - **adapters**: One `FormatAdapter` per input format, selected by registry
//! - **staging**: Local staging of remote payloads so retries do not re-fetch
//! - **reference**: Administrative/geographic code resolution
//! - **mapper**: Field mapping, type coercion, and record-key assignment
//! - **progress**: The durable checkpoint separating target from saved records
//! - **store**: Persistence boundary with Postgres and in-memory backends
//! - **orchestrator**: The run state machine with retry and resumption
//! - **alerts**: Fire-and-forget run lifecycle notifications
//! - **jobs / scheduler**: `ImportJob` work items consumed by an apalis worker

pub mod adapters;
pub mod alerts;
pub mod attrs;
pub mod config;
pub mod jobs;
pub mod mapper;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod reference;
pub mod scheduler;
pub mod staging;
pub mod store;

pub use adapters::{adapter_for, AttributeKind, AttributeSpec, Extraction, FormatAdapter, RawRecord};
pub use alerts::{AlertEvent, AlertNotifier, LogNotifier, WebhookNotifier};
pub use attrs::{AttributeStore, AttributeValue};
pub use config::{EngineConfig, ImportType, ImporterConfig, InputFormat};
pub use jobs::ImportJob;
pub use mapper::{RecordId, RecordMapper, TargetRecord};
pub use models::{AlertRule, RecordFailure, Run, RunResult, RunStatus, RunSummary};
pub use orchestrator::{ImportEngine, ResumeReport};
pub use progress::Checkpoint;
pub use reference::{GeoEntity, InMemoryReference, ReferenceDataset};
pub use scheduler::JobScheduler;
pub use store::{ImportStore, MemoryStore, PgStore};
