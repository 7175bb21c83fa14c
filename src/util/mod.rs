//! Shared utility routines

pub mod encoding;
