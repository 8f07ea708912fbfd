// Library root: the per-match watcher (session state and event loop) and its
// message types, exposed for the binary and integration tests.

pub mod app;
pub mod protocol;
pub mod session;
