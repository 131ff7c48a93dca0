pub mod cli;
pub mod client;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod daemon;
pub mod log;
pub mod paths;
pub mod pid;
pub mod plugin;
pub mod process;
pub mod protocol;
pub mod reactor;
pub mod scheduler;
pub mod site;
pub mod state_files;
pub mod updater;
