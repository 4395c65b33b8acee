//! Announcement-driven extraction pipeline for delisted A-share companies.
//!
//! The pipeline has three layers:
//! - the reconciling [`fetcher`] turns an inconsistent paginated source
//!   into a complete, deduplicated announcement set;
//! - the [`agent`] loop extracts the delisting facts from that set with a
//!   bounded extraction-validation-correction cycle over LLM rounds;
//! - the batch [`driver`] runs one company at a time with durable
//!   [`checkpoint`]s so an interrupted batch resumes cleanly.

pub mod agent;
pub mod checkpoint;
pub mod completion;
pub mod config;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod provider;
pub mod roster;
pub mod source;
pub mod types;

pub use checkpoint::CheckpointStore;
pub use completion::{ChatBackend, CompletionClient};
pub use config::Config;
pub use driver::{load_tasks, BatchDriver, BatchSummary, DriverOptions, ResultWriter};
pub use error::{CompletionError, ConversionError, FetchError};
pub use fetcher::ReconcilingFetcher;
pub use provider::{DocumentProvider, HttpDocumentProvider};
pub use roster::{ModelRoster, ModelState};
pub use source::{AnnouncementQuery, AnnouncementSource, CninfoSource};
pub use types::{
    AnnouncementId, AnnouncementRecord, CheckpointEntry, CompanyCode, ExtractionOutcome,
    FieldMap, PeriodType, TaskItem, TaskStatus,
};
