//! Package aggregate - domain model and state transitions.
//!
//! This module contains the shipment record as the scan engine sees it:
//! - Package types and states (typestate pattern)
//! - Intake/dispatch transitions and the pluggable transition policy

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::{DefaultTransitionPolicy, TransitionPolicy};
