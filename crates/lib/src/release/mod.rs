//! Tag-triggered multi-platform releases.
//!
//! ```text
//! tag ──► pattern? ──no──► Idle
//!            │yes
//!            ▼
//!      one job per matrix entry (JoinSet)
//!        checkout ─► resolve ─► vendor ─► build ─► test ─► upload
//!            │
//!            ▼
//!      Released | PartiallyFailed
//! ```

pub mod github;
pub mod host;
pub mod matrix;
pub mod orchestrator;
pub mod runner;
pub mod trigger;

pub use crate::pipeline::Stage as JobStage;
pub use github::GitHubHost;
pub use host::{DirectoryHost, HostError, ReleaseHost, RetryPolicy, UploadedAsset, upload_with_retry};
pub use matrix::{MatrixEntry, MatrixError};
pub use orchestrator::{JobOutcome, JobResult, ReleaseError, ReleaseOptions, ReleaseReport, ReleaseStatus, run_release};
pub use runner::{Job, JobArtifact, JobError, JobRunner, JobSource, LocalJobRunner};
pub use trigger::{TagPattern, TriggerError, resolve_tag, tag_from_ref};
