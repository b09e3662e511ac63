//! Cross-module tests: submission flow end to end, per-account
//! serialization under real concurrency, and store persistence.

mod nonce_persistence_tests;
mod submission_concurrency_tests;
