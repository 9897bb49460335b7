pub mod app;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod managers;
pub mod profile;

pub use error::{Error, ExecError, Result};
pub use exec::{CommandResult, Executor, SystemExecutor};
pub use managers::Host;
pub use profile::{Detector, SystemProfile};
