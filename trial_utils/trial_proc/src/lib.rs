//! Run a child process under a wall-clock deadline and make sure nothing it spawned outlives it.

pub mod supervise;

pub use supervise::{execute, ChildOutput, ProcConfig, ProcError, ProcHandle, ProcResult};
