pub mod password;
pub mod service;
pub mod store;
pub mod token;
pub mod types;


pub use service::{AccountError, AccountService};
pub use token::{SessionTokenConfig, SessionTokens};
