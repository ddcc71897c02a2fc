pub mod assembler;
pub mod candle_buffer;
pub mod orderbook;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use assembler::{MarketTick, OrderFlowSnapshot};
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use orderbook::{OrderBookManager, OrderBookSnapshot};
