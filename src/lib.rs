//! A client for remote feature flag resolution with a locally cached, change-stream invalidated
//! view of static flags.
//!
//! # Overview
//!
//! The crate revolves around a [`ResolutionClient`] that resolves typed flag values against a
//! flagd-compatible evaluation backend. Every resolution returns a [`ResolutionDetail`] carrying
//! the value, the variant and a [`Reason`]. Values the backend reports as
//! [`Reason::Static`] are cached locally and served with [`Reason::Cached`] until a change
//! notification invalidates them.
//!
//! The client keeps a single change stream open in the background. Its connection state
//! ([`ConnectionState`]) is reported through [`ProviderEvent`]s, delivered to
//! [`EventHandler`]s registered on [`ClientConfig`] and to [subscribers](ResolutionClient::subscribe).
//!
//! # Error Handling
//!
//! Resolution never fails: on error, the caller's default value is returned with an
//! [`ErrorKind`] describing what went wrong. Construction and lifecycle operations return
//! [`Result`] with the [`Error`] enum.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate under the `flagd` target.
//! Consider integrating a `log`-compatible logger implementation for better visibility into
//! connection state changes.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod cache;
mod client;
mod config;
mod details;
mod error;
mod events;
mod retry;
mod state;
mod stream;
pub mod transport;

pub use client::ResolutionClient;
pub use config::{CacheKind, ClientConfig, ClientConfigBuilder};
pub use details::{
    ErrorKind, EvaluationContext, FlagKind, FlagMetadata, FlagType, FlagValue, ObjectValue, Reason,
    ResolutionDetail,
};
pub use error::{Error, Result};
pub use events::{EventHandler, ProviderEvent, ProviderEventKind};
pub use state::ConnectionState;
