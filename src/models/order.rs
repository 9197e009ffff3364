//! Order placement models.
//!
//! Volume and price cross the wire as on-chain integers only: volume in
//! the base asset's smallest units, price in quote smallest units per one
//! whole base token.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{LedgerId, u64_str};
use crate::fixed_point::Amount;

/// Side of an auction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Bid,
    Ask,
}

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(#[serde(with = "u64_str")] pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for placing an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceOrderRequest {
    pub ledger: LedgerId,
    pub side: OrderSide,
    pub volume: Amount,
    pub price: Amount,
}

/// Parameters for replacing an existing order in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaceOrderRequest {
    pub order_id: OrderId,
    pub volume: Amount,
    pub price: Amount,
}

/// An order of the user resting until the next clearing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub ledger: LedgerId,
    pub side: OrderSide,
    pub volume: Amount,
    pub price: Amount,
}

/// Acknowledgement of a placed or replaced order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
}
