//! The _hsmgate_ library crate.
//!
//! hsmgate exposes cryptographic tokens to local clients through a small
//! action protocol. An [`ActionRouter`](dispatch::ActionRouter) resolves the
//! provider named in an action through the
//! [`ProviderRegistry`](registry::ProviderRegistry) and drives the
//! authentication state of its session. PIN requests are handed to observers
//! through the [`NotificationBridge`](notify::NotificationBridge).

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod registry;
pub mod runtime;
pub mod token;
