pub mod config;
pub mod init;
pub mod queue;
pub mod run;
pub mod story;
