//! Photo Lifecycle Service
//!
//! Event-driven pipeline that takes a photo from upload to reviewed record.
//! Upload notifications are validated and turned into records, malformed
//! uploads are reaped from the bucket, metadata events are routed by
//! attribute onto per-field merges, review outcomes are written back, and
//! every review status change is mailed to the photo's owner.
//!
//! ## Features
//!
//! - **At-least-once consumers**: batch receive with per-message
//!   acknowledgement, bounded redelivery and dead-letter queues
//! - **Idempotent writes**: conditional record creation and attribute-level
//!   merges, safe under redelivery
//! - **Ordered change feed**: every effective record write is appended to a
//!   per-store feed that drives review notifications
//! - **Pluggable backends**: in-memory for local runs and tests, PostgreSQL
//!   and S3 for deployments
//!
//! ## Architecture
//!
//! ```text
//! Object store            Upload queue              Record store
//! ┌──────────────┐       ┌──────────────┐          ┌──────────────┐
//! │ photos       │──────▶│ notifications│          │ records      │
//! └──────────────┘       └──────────────┘          │ change feed  │
//!        ▲                      │                  └──────────────┘
//!        │                      ▼                     ▲   ▲    │
//! ┌──────────────┐       ┌──────────────┐  create    │   │    │
//! │ Invalid      │◀──DLQ─│ Ingest       │────────────┘   │    │
//! │ Object Reaper│       │ Validator    │                │    │
//! └──────────────┘       └──────────────┘                │    ▼
//!                                                        │ ┌──────────────┐
//! Metadata topic                                         │ │ Change       │
//! ┌──────────────┐       ┌──────────────┐   merge        │ │ Notifier     │
//! │ image-events │──────▶│ Metadata     │────────────────┤ └──────────────┘
//! │ (filtered    │       │ Applier      │                │        │
//! │  fan-out)    │       └──────────────┘                │        ▼
//! │              │       ┌──────────────┐   merge        │     Mailer
//! │              │──────▶│ Status       │────────────────┘
//! └──────────────┘       │ Updater      │
//!                        └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod mail;
pub mod messages;
pub mod model;
pub mod objects;
pub mod pipeline;
pub mod store;
pub mod transport;

pub use api::AppState;
pub use config::Config;
pub use consumer::{BatchReport, ChangeFeedConsumer, MessageHandler, Outcome, QueueConsumer};
pub use error::{PipelineError, Result};
pub use model::{PhotoRecord, ReviewStatus};
pub use pipeline::{Backends, Pipeline, PipelineReport};
