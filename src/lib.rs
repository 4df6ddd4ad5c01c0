//! Terminal monitor that turns `arena-fight <task>` requests typed into a
//! hosted coding-assistant session into fights on the arena server, with the
//! assistant's own exploration output gathered as context.

pub mod activity;
pub mod agents;
pub mod cli;
pub mod commands;
pub mod config;
pub mod gathering;
pub mod launcher;
pub mod line;
pub mod log;
pub mod monitor;
pub mod sanitize;
pub mod solution;
pub mod supervisor;
pub mod terminal;
pub mod trigger;
