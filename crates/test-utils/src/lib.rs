//! Shared helpers for clinhub integration tests.

pub mod db;
