//! CLI command handlers

mod fetch;
mod login;
mod run;

pub use fetch::*;
pub use login::*;
pub use run::*;
