//! File system helpers: directory-set walking and artifact staging.

pub mod staging;
pub mod walker;
