// Binance USDⓈ-M futures adapter.

pub mod client;

pub use client::BinanceFuturesClient;
