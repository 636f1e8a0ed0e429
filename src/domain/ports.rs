//! Port interfaces for the exchange boundary. The live Kraken client
//! implements these; tests substitute mocks.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::errors::ExchangeError;

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub txid: String,
    /// pending, filled, timeout, canceled, expired
    pub status: String,
    pub filled_volume: f64,
    pub avg_fill_price: f64,
    pub fee: f64,
}

#[async_trait]
pub trait ExchangeExecution: Send + Sync {
    /// Place an order; returns the exchange transaction id.
    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        volume: f64,
        price: Option<f64>,
    ) -> Result<String, ExchangeError>;

    async fn query_order(&self, txid: &str) -> Result<OrderFill, ExchangeError>;

    async fn cancel_order(&self, txid: &str) -> Result<(), ExchangeError>;

    async fn cancel_all_orders(&self) -> Result<(), ExchangeError>;

    async fn get_balance(&self) -> Result<HashMap<String, f64>, ExchangeError>;
}
