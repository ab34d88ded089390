//! Helpers for tests that run against a real Postgres.
//!
//! Every test gets its own database, created from the `TESTS_DATABASE_*` environment variables and
//! dropped when the [`database::TestDatabase`] goes out of scope.

pub mod database;
pub mod failpoints;
pub mod notify;
pub mod schema;
