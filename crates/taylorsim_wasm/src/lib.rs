//! WASM bindings for the taylorsim core library.
//!
//! This crate exposes a thin wrapper around `taylorsim_core` so the browser
//! demos can pick a scene and an integrator, step the simulation and read back
//! drawable positions.

mod simulation;

pub use simulation::WasmSimulation;
