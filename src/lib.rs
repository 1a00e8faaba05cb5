//! Document numbering and approval workflow engine.
//!
//! Issues collision-free document numbers, computes GST breakdowns for
//! financial logs and drives each document kind through its role-gated
//! approval graph. Persistence is a sled database shared across threads.
pub mod config;
pub mod error;
pub mod record;
pub mod sequence;
pub mod service;
pub mod store;
pub mod tax;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod workflow;

pub use error::{DocflowError, ErrorCode, Result};
pub use record::{Approval, DocumentPayload, DocumentRecord, Financials};
pub use service::DocumentService;
pub use store::{DocumentStore, SledStore};
pub use types::{Actor, Money, Percent, Role, TimeStamp};
pub use workflow::{Action, DocumentKind, Status};
