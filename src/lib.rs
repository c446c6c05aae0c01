pub mod cli;
pub mod console;
pub mod events;
pub mod flags;
pub mod init;
pub mod launcher;
pub mod log;
pub mod logging;
pub mod paths;
pub mod readiness;
pub mod scanner;
pub mod settings;
pub mod startup;
pub mod state;
pub mod supervisor;
pub mod sys;
