//! PgStore integration tests.
//!
//! Requires `TEST_ADMIN_DATABASE_URL`; each test runs in its own database.

mod store;
