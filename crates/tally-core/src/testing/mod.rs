//! Testing utilities for tally.
//!
//! Ledger semantics are unit tested against the in-memory backend; Postgres
//! behaviour is exercised against a real server provisioned here.

pub mod db;

pub use db::{IsolatedTestDb, TestDatabase, TEST_DATABASE_URL_VAR};
