//! IACP gateway library root.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod oversight;
pub mod protocol;
pub mod ratelimit;
pub mod safety;
pub mod web;

pub use audit::{AuditFilter, AuditLog, AuditRecord, Disposition};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Rejection, Result};
pub use gateway::{DeliveryOutcome, Gateway, MailboxStore, Transport};
pub use oversight::{ApprovalChannel, ApprovalDecision, OversightGate};
pub use protocol::{AgentIdentity, Envelope, EnvelopeBuilder, MessageType, Recipient};
pub use safety::{Classifier, SafetyGate};
pub use web::run_server;
