#![allow(
    clippy::print_stderr,
    reason = "test infrastructure echoes the server output with eprintln for debugging"
)]
#![allow(clippy::unwrap_used, reason = "test infrastructure can panic on errors")]

pub mod cli;
pub mod test_server;
