pub mod bybit;
pub mod ws;

pub use bybit::{BybitClient, ExchangePosition, OrderRequest, OrderResponse, OrderType};
pub use ws::{PrivateEvent, PrivateWsClient};
