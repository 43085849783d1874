//! Bulk retrieval of gated video assets
//!
//! A run reads identifiers from an [`IdentifierSource`], resolves each to a
//! manifest through the platform's [`Resolver`], picks the best
//! representations, downloads them with the resumable [`ChunkedDownloader`],
//! optionally hands them to an external tool, and records the outcome in the
//! [`WorkQueue`] files. [`Orchestrator`] ties the steps together.

pub mod config;
pub mod downloader;
pub mod external;
pub mod manifest;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod source;

pub use config::{HarvesterConfig, Platform};
pub use downloader::{
    ChunkedDownloader, DownloadConfig, DownloadOutcome, DownloadTask, HarvestError, IntoProgressCallback,
    NullProgressReporter, ProgressCallback, ProgressEvent, ProgressReporter, Result, TracingProgressReporter,
};
pub use orchestrator::{IdentifierOutcome, Orchestrator, RunContext, RunSummary};
pub use queue::WorkQueue;
pub use resolver::{ManifestReference, ResolvedMedia, Resolver};
pub use session::{AuthContext, Credentials};
pub use source::IdentifierSource;
