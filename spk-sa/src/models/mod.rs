//! Data models for spk-sa (Session Analysis service)
//!
//! - Session record and its state machine
//! - Write-once stage results

pub mod session;
pub mod stage_result;

pub use session::{Session, StateTransition};
pub use stage_result::StageResult;
