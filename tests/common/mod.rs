//! Common test infrastructure
//!
//! Integration tests run the engine against a real SQLite database in a
//! temporary directory. Tests should only import from this module, not from
//! internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestEngine, POTATO};
//!
//! #[test]
//! fn test_products_are_listed() {
//!     let env = TestEngine::new();
//!     let potato = env.create_product(POTATO);
//!     assert_eq!(env.engine.list_products().unwrap()[0].id, potato);
//! }
//! ```

mod constants;
mod fixtures;

// Public API - this is what tests import
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{date, observation, TestEngine};
