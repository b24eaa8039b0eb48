//! Per-family ISP protocol engines (§4.6) and the `auto` autodetect
//! wrapper (§4.7), built on the frame/transport/session primitives in
//! `isp-core`.

pub mod autodetect;
mod common;
pub mod engine;

pub use autodetect::autodetect;
pub use engine::{spec_for, DialectSpec, Engine, SPECS};
