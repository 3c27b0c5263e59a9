//! Librarium Importer
//!
//! CSV bulk import pipeline:
//! 1. `parser` validates the header and streams typed rows
//! 2. `resolver` gets or creates authors and genres by name
//! 3. `persister` writes a book and its links inside the chunk transaction
//! 4. `orchestrator` chunks rows and tracks the job record
//! 5. `dispatcher` runs jobs in the background; `reaper` fails abandoned ones

pub mod dispatcher;
pub mod errors;
pub mod orchestrator;
pub mod parser;
pub mod persister;
pub mod reaper;
pub mod resolver;

pub use dispatcher::{ImportWorker, LocalDispatcher};
pub use errors::ImportError;
pub use orchestrator::{ChunkReport, ImportOrchestrator, ImportSummary, RunOutcome};
pub use parser::{CsvRow, RowFailure, RowReader, EXPECTED_HEADERS};
pub use persister::{persist_row, RowOutcome};
pub use reaper::{reap_stale_jobs, spawn_reaper};
pub use resolver::{resolve, split_names, EntityKind};
