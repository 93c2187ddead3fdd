//! Native module contains executors that run the toolchain directly on the
//! host as child processes, without a container runtime in between.
//! Every phase runs in its own process group so it can be killed as a whole.

pub mod diagnostics;
pub mod executor;
pub mod process;
pub mod single_file;
