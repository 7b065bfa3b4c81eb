pub mod command;
pub mod terraform;

pub use command::{ChildProcess, CommandError, ProcessKiller};
