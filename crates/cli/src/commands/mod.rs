//! CLI command implementations

pub mod drains;
pub mod health;
pub mod status;
