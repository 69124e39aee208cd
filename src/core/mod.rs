pub mod audit;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod identity;
pub mod ledger;
pub mod retry;
pub mod snapshot;
pub mod terminal;
pub mod variants;
