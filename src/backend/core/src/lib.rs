#![allow(clippy::result_large_err)]
//! # Auto-Apply Core
//!
//! The autonomous job-application pipeline of the platform.
//!
//! ## Architecture
//!
//! - **Scoring**: Fit Index, a bounded 0-100 candidate/posting score with an auditable breakdown
//! - **Admission**: Per-user settings, hard filters and quota bookkeeping
//! - **Jobs**: Queue service, quota-paced dispatcher, worker pool and the job state machine
//! - **Ledger**: Append-only credit ledger with idempotent job charges and refunds
//! - **Store**: In-memory and PostgreSQL persistence with compare-and-set writes
//! - **Collaborators**: Profile directory, job catalog, similarity, submission and notifications
//! - **Telemetry**: Structured logging with PII redaction, Prometheus metrics

pub mod admission;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod models;
pub mod pagination;
pub mod scoring;
pub mod store;
pub mod telemetry;

pub use error::{AutoApplyError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{admit, AdmissionDecision, AdmissionFilters, ApplyMode, AutoApplyConfig, RejectReason};
    pub use crate::collaborators::{Collaborators, InMemoryCollaborators, PlatformClient};
    pub use crate::config::{ChargePolicy, Config};
    pub use crate::error::{AutoApplyError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::jobs::{
        AutoApplyJob, DispatchReport, DispatchScheduler, Dispatcher, EnqueueReport, ErrorType, JobOutcome,
        JobStatus, Pipeline, QueueService, QueueStats, WorkerPool,
    };
    pub use crate::ledger::{CreditLedger, CreditType, CreditWallet, LedgerEntry, LedgerOperation, UNLIMITED};
    pub use crate::models::{CandidateProfile, EmploymentType, JobPosting, LocationType};
    pub use crate::pagination::{OffsetPagination, Page, PageMetadata};
    pub use crate::scoring::{FitIndexResult, FitIndexScorer, ScoreBreakdown};
    pub use crate::store::{JobFilter, MemoryStore, PgStore, Stores};
}
