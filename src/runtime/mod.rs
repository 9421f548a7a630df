//! Process runtime module for termpal
//!
//! Tools that run external programs (shell, python) go through a
//! [`ProcessRuntime`]. The native runtime executes directly on the host with a
//! cleared environment; other runtimes can be slotted in behind the trait.

pub mod native;
pub mod types;

pub use native::NativeRuntime;
pub use types::{CommandOutput, ProcessRuntime, ProcessSpec};
