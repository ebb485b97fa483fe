pub mod cleanup;
pub mod config;
pub mod ledger;
pub mod pending;
pub mod status;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;
