//! execforge: a queue-driven worker for running compilation and
//! execution tools against remotely submitted source files.
//!
//! Tasks arrive on a durable queue; each one names a tool, references
//! its input files in an object store and lists the outputs it expects
//! back. Workers download the inputs, run the tool, upload what it
//! produced and publish the final status to a compare-and-swap guarded
//! key-value record, acknowledging the message only once everything is
//! persisted.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod message;
pub mod notify;
pub mod retry;
pub mod runner;
pub mod store;
pub mod submit;
pub mod worker;

pub use error::WorkerError;
