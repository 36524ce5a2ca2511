//! Trade Persistence Adapters
//!
//! Implementations of [`TradeRepository`](crate::application::ports::TradeRepository).

mod in_memory;

pub use in_memory::InMemoryTradeRepository;
