pub mod config;
pub mod error;
pub mod fixture;
pub mod ledger;
pub mod naming;
pub mod reconcile;
pub mod resolver;
pub mod runtime;
pub mod schema;
pub mod sync;
pub mod writer;
