//! Operator console shared between firmware and emulator front-ends.
//!
//! The grammar lives in [`grammar`] and walks the [`catalog`] tables with a
//! token/parse pipeline that stays compatible with `no_std`.

pub mod catalog;
pub mod commands;
pub mod grammar;
pub mod status;
