pub mod action;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod instance;
pub mod io;
pub mod machine;
pub mod orchestrator;
pub mod paths;
pub mod store;
pub mod template;
pub mod types;

pub use error::{Result, TemplateError, WorkflowError};
pub use orchestrator::{AdvanceOptions, AdvanceOutcome, Orchestrator, Settings};
