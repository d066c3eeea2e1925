// src/domain/mod.rs

//! Layer domain abstractions.
//!
//! This module defines the domain-level capability implemented by every
//! channel-layer backend, plus the message model the backends exchange. It
//! intentionally avoids any reference to concrete stores or client libraries.
//!
//! Concrete implementations of this interface live under `src/layers/`.

mod layer;
mod message;

pub use layer::{ChannelLayer, LayerPtr, DEFAULT_CHANNEL_PREFIX};
pub use message::{Message, Value};

pub(crate) use message::{validate_channel_name, validate_group_name};
