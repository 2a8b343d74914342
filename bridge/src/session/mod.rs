// Session modules for the pane bridge
// Shared between the bridged daemon and the bridge client command

pub mod backend;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod registry;
pub mod terminal;

// Daemon client (Unix sockets only)
#[cfg(unix)]
pub mod daemon_client;
