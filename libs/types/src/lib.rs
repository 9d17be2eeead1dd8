//! Types library for the order book mirror
//!
//! Core type definitions shared by the mirror engine and its collaborators,
//! so every layer agrees on what a symbol, a price or a side is.
//!
//! # Modules
//! - `ids`: Identifiers (Symbol, LevelId)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `order`: Book side
//! - `errors`: Validation errors

pub mod errors;
pub mod ids;
pub mod numeric;
pub mod order;
