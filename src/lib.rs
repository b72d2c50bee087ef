//! Bastion Core - security token and bastion tunnel lifecycle
//!
//! Keeps a cloud CLI security token fresh, provisions ephemeral bastion
//! port-forwarding sessions with it, and supervises the SSH client that
//! carries the local port through the session. Every state change is
//! broadcast through an [`events::EventHub`] so a front end can observe the
//! core without polling.

pub mod auth;
pub mod bastion;
pub mod config;
pub mod connection;
pub mod context;
pub mod events;
pub mod logging;
pub mod scheduler;
pub mod token;
pub mod tunnel;
pub mod util;

pub use connection::{BastionConnection, ConnectionError};
pub use context::CoreContext;
pub use events::{CoreEvent, EventHub, SubscriptionId};
pub use scheduler::{RenewalScheduler, SchedulerState};
pub use token::{SecurityToken, TokenManager};
