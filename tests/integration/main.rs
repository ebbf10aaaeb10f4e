//! Integration test binary -- every scenario runs the bridge on loopback
//! and drives it with a scripted phone.
//!
//! See the matklad pattern: <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod helpers;

mod call_flow;
mod cancel_and_timeout;
mod media;
mod persistence;
mod rejections;
