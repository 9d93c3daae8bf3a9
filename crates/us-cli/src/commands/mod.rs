//! CLI subcommand implementations.

pub mod init;
pub mod sessions;
pub mod site;
pub mod util;
