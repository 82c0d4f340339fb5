//! Integration tests for crossbake-lib.

#![cfg(unix)]

mod build_tests;
mod common;
mod deps_tests;
