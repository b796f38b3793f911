//! Test Helper Utilities
//!
//! Shared utilities for testing spk-sa

#![allow(dead_code)]

pub mod audio_generator;
pub mod scripted_adapter;
pub mod test_app;

pub use audio_generator::wav_bytes;
pub use scripted_adapter::{CallEvent, ScriptedAdapter};
pub use test_app::{create_test_app, read_sse, read_sse_until, test_config, TestApp};
