//! Users and owner-scoped products behind the admission layer.

pub mod models;
pub mod store;

pub use models::{Extreme, NewProduct, Product, User};
pub use store::{InventoryStore, StoreError};
