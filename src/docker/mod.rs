//! Container-backed executor. Each build and run phase gets a fresh,
//! network-less container with the workspace bind mounted at `/app`.

pub mod executor;
