//! Business logic services
//!
//! The mirror engine proper. Everything here talks to the server through
//! the `adapters::imap` traits and to storage through `adapters::sqlite`,
//! so it runs the same against a real account and the in-memory test server.

pub mod sync;
