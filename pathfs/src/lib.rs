//! pathfs: path-addressed filesystem operations served over FUSE by a pluggable storage
//! engine.
pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod fuse;
pub mod ops;
