//! Gmail REST API access.
//!
//! ## Flow
//! Gmail watch → Pub/Sub push → relay → `history.list` pages → `messages.get` per added message
//!
//! The relay only talks to [`MailApi`]; [`GmailClient`] is the production implementation.

mod client;
mod types;

pub use client::{GmailClient, MailApi};
pub use types::*;
