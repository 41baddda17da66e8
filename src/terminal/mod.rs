pub mod browser;
pub mod command;
pub mod port;
