//! Translation revision ledger with cross-project import and video
//! reference reconciliation.

pub mod aggregates;
pub mod approval;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod references;
pub mod retry;
pub mod scheduler;
pub mod search;
pub mod spellcheck;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use db::Database;
pub use error::{LedgerError, Result};
pub use ledger::{RevisionLedger, SubmitReceipt, SubmitRequest};
pub use models::{TextUnit, TranslationRevision, UnitKey};
pub use reconcile::{CrossProjectReconciler, ImportBatch, ImportReport};
pub use references::{ResolverReport, ScoredReferenceResolver};
pub use scheduler::MaintenanceReport;
