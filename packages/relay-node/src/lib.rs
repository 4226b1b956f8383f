//! Node agent core: backend supervision, config sync, and the control API.

pub mod backend;
pub mod cli;
pub mod config;
pub mod controller;
pub mod host;
pub mod router;
pub mod tools;
pub mod user;
