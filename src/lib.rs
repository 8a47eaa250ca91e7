//! An in-process publish/subscribe hub for timestamped measurements.
//!
//! Producers push [`sample::Sample`]s at paths in a [`tree::Tree`] of typed
//! entries; the [`hub::Hub`] re-types, filters, and routes them to
//! observations and outputs. See the [`hub`] module for the public surface.

pub mod config;
pub mod error;
pub mod hub;
pub mod json;
pub mod path;
pub mod res;
pub mod sample;
pub mod snapshot;
pub mod tree;
