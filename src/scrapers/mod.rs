pub mod base;
pub mod coingecko;
pub mod yahoo;
