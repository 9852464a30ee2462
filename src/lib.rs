//! Core of a minimal anonymous FTP server built on a single-threaded
//! readiness-polling reactor. See `reactor`, `connection`, and `server`
//! for the three pieces that matter; `cli` is the host-process glue that
//! turns command-line flags into the inputs the core needs.

pub mod cli;
pub mod command;
pub mod connection;
pub mod eol;
pub mod fd;
pub mod path;
pub mod pool;
pub mod reactor;
pub mod server;
