//! Test doubles for exercising the engine: capabilities with scripted
//! behaviour and sinks that record what they are given.

pub mod capabilities;
pub mod fixtures;
pub mod sinks;

pub use capabilities::{ConcurrencyProbe, ScriptedCapability, SlowCapability, StreamingCapability};
pub use fixtures::{invocation, write_config};
pub use sinks::{ChannelSink, FlakySink, RecordingSink};
