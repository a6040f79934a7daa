//! # pit-id
//!
//! Typed identifiers for the pit cluster scheduler.
//!
//! ## Design Principles
//!
//! - Names of fleet members and users come from external registries and are
//!   validated, never generated here
//! - Job ids and process ids are plain integers with strict parsing
//! - Every identifier roundtrips through its string form (parse → format → parse)
//! - Identifiers are typed so a node name can never be passed as a user name
//!
//! ## Formats
//!
//! - `NodeId`, `UserId`: `[A-Za-z0-9._-]+`, e.g. `gpu-node-03`, `alice`
//! - `JobId`: monotonically assigned decimal integer starting at 1
//! - `Pid`: operating-system process id as reported by a node

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
