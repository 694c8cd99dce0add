//! `synapse-kernel` – gating and health supervision.
//!
//! Enforces the introspection core's admission and liveness policies; it
//! does not generate hypotheses or investigate anything itself.
//!
//! # Modules
//!
//! - [`kernel_gate`] – [`InvestigationGate`][kernel_gate::InvestigationGate]:
//!   the meta-loop filter and queue-depth check every [`CuriosityQuestion`][synapse_types::CuriosityQuestion]
//!   must pass before a worker is allowed to investigate it.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: tracks heartbeats from
//!   registered daemons and detects frozen components so a supervisor can
//!   alert or restart.

pub mod kernel_gate;
pub mod watchdog;

pub use kernel_gate::{GateRejection, InvestigationGate, MetaLoopFilter};
pub use watchdog::{ComponentHealth, Watchdog};
