//! Resource registry for LabMan.
//!
//! Tracks devices, sample positions and samples, and arbitrates exclusive
//! custody of them between tasks:
//!
//! - [`ResourceRegistry::reserve`] claims a whole request or nothing
//! - [`ResourceRegistry::release`] is idempotent and only frees what the
//!   released lock claimed
//! - sample moves require locks on both ends

#![warn(missing_docs)]

mod error;
mod lock;
mod registry;
mod reserve;
mod samples;

pub use error::{RegistryError, Result};
pub use lock::{GrantedDevice, ResourceLock};
pub use registry::{RegistrySnapshot, ResourceRegistry};
