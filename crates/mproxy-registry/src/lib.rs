//! Closed registry of upstream services, model families and prices.
//!
//! Classification of raw model ids into families is table-driven: one ordered
//! regex list per service, compiled once at startup, first match wins.

mod classify;
mod family;
mod price;
mod service;

pub use classify::{classify, reassign_model};
pub use family::{ModelFamily, sample_models};
pub use price::{ModelPrice, per_image_usd, price_of};
pub use service::Service;
