//! `synapse-bus` — the Chemical Signal Bus (ChemBus).
//!
//! Topic-based publish/subscribe message passing between the daemons that
//! make up the introspection core: the Event Observer, the Intent Router,
//! the Investigation Worker Pool, and the Affective Self-Regulator.
//!
//! # Modules
//!
//! - [`bus`] — headless, typed, topic-based pub/sub bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{ChemBus, TopicSubscriber};
