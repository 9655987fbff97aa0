pub mod selector;
pub mod strategy;

pub use selector::{InFlightGuard, PoolSelector, SelectError, SelectorState};
pub use strategy::SelectionStrategy;
