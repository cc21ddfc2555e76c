//! Integration tests against the public API
//!
//! Sessions run on spawned tasks over an in-memory backend, the way the
//! protocol layer drives them.

mod sessions;
mod support;
