//! Destination file system helpers.

pub mod control;
pub mod walker;
