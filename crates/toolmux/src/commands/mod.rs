//! Command handlers for the toolmux CLI.

pub mod auth;
pub mod logging;
pub mod paths;
pub mod tools;

pub use auth::*;
pub use logging::*;
pub use paths::*;
pub use tools::*;
