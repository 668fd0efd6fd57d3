#![no_std]

// Phase calibration for an SD-to-storage bridge.
//
// The bridge exposes its tuning registers only through a configuration image
// written and read while the card is deselected. This crate finds a transmit
// and receive phase pair that survives the tuning command, escalating voltage
// and driver strength when the link refuses to lock. It avoids the standard
// library so the same engine runs in firmware and in host tooling.

#[macro_use]
mod fmt;

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod history;
pub mod inject;
pub mod ladder;
pub mod phase;
pub mod repl;
pub mod telemetry;
pub mod window;
