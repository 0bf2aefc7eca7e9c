//! File system helpers.

pub mod compress;
pub mod walker;
