//! `actions` crate: the contract for post-transition side effects.
//!
//! Every handler (email, webhook, notification, field update) implements
//! [`ActionHandler`]. The engine only ever talks to an [`ActionDispatcher`].

pub mod error;
pub mod traits;
pub mod dispatch;
pub mod mock;

pub use error::ActionError;
pub use traits::{ActionContext, ActionDispatcher, ActionHandler, ActionInvocation, ActionKind};
pub use dispatch::{DispatchConfig, HandlerRegistry, RegistryDispatcher};
