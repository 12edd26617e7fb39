pub mod config;
pub mod error;
pub mod event;
pub mod json;
pub mod traits;
pub mod types;

pub use config::{AppConfig, RunConfig};
pub use error::{BraidError, Result, ValidationError};
pub use event::{EventBus, EventKind, RunEvent};
pub use types::*;
