//! I/O helpers for autopilot commands.

pub mod config;
pub mod detect;
pub mod invoker;
pub mod pause;
pub mod paths;
pub mod process;
pub mod scaffold;
pub mod state_store;
pub mod templates;
