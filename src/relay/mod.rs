//! Prompt orchestration on top of the RPC client.

mod aggregator;
mod pool;
mod reduce;
mod ui;

pub use aggregator::*;
pub use pool::*;
pub use reduce::*;
pub use ui::*;
