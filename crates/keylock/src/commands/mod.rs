//! Command implementations for the keylock CLI

pub mod exec;
pub mod serve;
