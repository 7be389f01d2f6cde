pub mod cli;
pub mod config;
pub mod error;
pub mod github;

pub use error::TokenError;
pub use github::TokenBroker;
