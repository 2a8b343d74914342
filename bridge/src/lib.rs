// Session management (shared between the daemon and the client command)
pub mod session;

// Locating the daemon binary
pub mod cli_paths;

// Async polling helpers used by unit and binary tests
#[doc(hidden)]
pub mod test_utils;
