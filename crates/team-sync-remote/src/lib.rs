//! Remote transport for team project sync.
//!
//! `HttpRemoteStore` talks to the deployment's HTTP function API and exchanges the
//! session token for short-lived bearer tokens through `TokenManager`.

mod http;
mod token_manager;

pub use http::{HttpRemoteConfig, HttpRemoteStore};
pub use token_manager::TokenManager;
