//! Integration test suite for claudio.
//!
//! These tests drive the public API end to end against real temp
//! directories: sessions are locked, saved and recovered on disk, plans are
//! read from files, and planning is resumed through an attached session.
//!
//! # Test Categories
//!
//! - `session_lifecycle`: create/attach/save/recover across "processes"
//! - `plan_validation`: plan files through parsing, validation and ordering
//! - `multi_pass`: resumable multi-planner coordination

mod fixtures;

mod multi_pass;
mod plan_validation;
mod session_lifecycle;
