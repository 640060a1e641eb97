//! Application-level orchestration.
//!
//! This module owns the launch engine at runtime and turns its events into
//! output for the presentation layers. CLI and shell layers call into this
//! module to keep responsibilities separated.

mod controller;

pub(crate) use controller::{run_controller, ControllerCtx, ControllerReport, UiCommand};
