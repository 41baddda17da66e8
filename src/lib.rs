// Declare the main library modules
pub mod api;
pub mod checks;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod runtime;
pub mod startup;
pub mod terminal;
