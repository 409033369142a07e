pub mod client;

pub use client::{BinanceClient, OrderQty, OrderSide};
