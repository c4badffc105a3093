use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{Extreme, NewProduct, Product, User};

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username and password are required")]
    InvalidRegistration,
    #[error("username already in use")]
    DuplicateUsername,
    #[error("user not found")]
    UnknownUser,
    #[error("password mismatch")]
    InvalidPassword,
    #[error("invalid product fields")]
    InvalidProduct,
    #[error("quantity must not be negative")]
    InvalidQuantity,
    #[error("product not found")]
    ProductNotFound,
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// In-memory users and products. Products are only ever visible to their owner.
#[derive(Debug, Clone, Default)]
pub struct InventoryStore {
    users: Arc<RwLock<HashMap<String, User>>>,
    products: Arc<RwLock<HashMap<Uuid, Product>>>,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, username: &str, password: &str, email: Option<String>) -> Result<User, StoreError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(StoreError::InvalidRegistration);
        }
        if self.users.read().await.contains_key(username) {
            return Err(StoreError::DuplicateUsername);
        }

        let password_hash = hash_password(password.to_string()).await?;
        let user = User {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            email,
            password_hash,
            created_at: Utc::now(),
        };

        let mut users = self.users.write().await;
        // re-check: another registration may have won while we were hashing
        if users.contains_key(username) {
            return Err(StoreError::DuplicateUsername);
        }
        users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User, StoreError> {
        let user = self
            .users
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or(StoreError::UnknownUser)?;
        if verify_password(password.to_string(), user.password_hash.clone()).await? {
            Ok(user)
        } else {
            Err(StoreError::InvalidPassword)
        }
    }

    pub async fn insert_product(&self, owner: Uuid, new: NewProduct) -> Result<Product, StoreError> {
        if !new.is_valid() {
            return Err(StoreError::InvalidProduct);
        }
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4(),
            user_id: owner,
            name: new.name,
            kind: new.kind,
            sku: new.sku,
            image_url: new.image_url,
            description: new.description,
            quantity: new.quantity,
            price: new.price,
            created_at: now,
            updated_at: now,
        };
        self.products.write().await.insert(product.id, product.clone());
        Ok(product)
    }

    pub async fn update_quantity(&self, owner: Uuid, id: Uuid, quantity: i64) -> Result<Product, StoreError> {
        if quantity < 0 {
            return Err(StoreError::InvalidQuantity);
        }
        let mut products = self.products.write().await;
        let product = products
            .get_mut(&id)
            .filter(|p| p.user_id == owner)
            .ok_or(StoreError::ProductNotFound)?;
        product.quantity = quantity;
        product.updated_at = Utc::now();
        Ok(product.clone())
    }

    /// Owner's products, oldest first. `page` is 1-based.
    pub async fn list_products(&self, owner: Uuid, page: usize, limit: usize) -> Vec<Product> {
        let mut owned = self.owned_by(owner).await;
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        owned
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(limit))
            .take(limit)
            .collect()
    }

    pub async fn get_product(&self, owner: Uuid, id: Uuid) -> Result<Product, StoreError> {
        self.products
            .read()
            .await
            .get(&id)
            .filter(|p| p.user_id == owner)
            .cloned()
            .ok_or(StoreError::ProductNotFound)
    }

    pub async fn quantity_extreme(&self, owner: Uuid, which: Extreme) -> Result<Product, StoreError> {
        let owned = self.owned_by(owner).await;
        let pick = match which {
            Extreme::Most => owned.into_iter().max_by_key(|p| p.quantity),
            Extreme::Least => owned.into_iter().min_by_key(|p| p.quantity),
        };
        pick.ok_or(StoreError::ProductNotFound)
    }

    async fn owned_by(&self, owner: Uuid) -> Vec<Product> {
        self.products
            .read()
            .await
            .values()
            .filter(|p| p.user_id == owner)
            .cloned()
            .collect()
    }
}

// Argon2 is deliberately slow; keep it off the async workers.
async fn hash_password(password: String) -> Result<String, StoreError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| StoreError::Hashing(e.to_string()))
    })
    .await
    .map_err(|e| StoreError::Hashing(e.to_string()))?
}

async fn verify_password(password: String, hash: String) -> Result<bool, StoreError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash).map_err(|e| StoreError::Hashing(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| StoreError::Hashing(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone(quantity: i64) -> NewProduct {
        NewProduct {
            name: "Phone".into(),
            kind: "Electronics".into(),
            sku: "PHN-001".into(),
            image_url: String::new(),
            description: String::new(),
            quantity,
            price: 999.99,
        }
    }

    #[tokio::test]
    async fn register_and_authenticate() {
        let store = InventoryStore::new();
        let user = store.register("puja", "mypassword", None).await.unwrap();
        assert_ne!(user.password_hash, "mypassword");

        let again = store.authenticate("puja", "mypassword").await.unwrap();
        assert_eq!(again.user_id, user.user_id);

        assert!(matches!(
            store.authenticate("puja", "wrong").await,
            Err(StoreError::InvalidPassword)
        ));
        assert!(matches!(
            store.authenticate("nobody", "x").await,
            Err(StoreError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn duplicate_username() {
        let store = InventoryStore::new();
        store.register("puja", "a", None).await.unwrap();
        assert!(matches!(
            store.register("puja", "b", None).await,
            Err(StoreError::DuplicateUsername)
        ));
    }

    #[tokio::test]
    async fn products_are_owner_scoped() {
        let store = InventoryStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let p = store.insert_product(alice, phone(5)).await.unwrap();

        assert!(store.get_product(alice, p.id).await.is_ok());
        assert!(matches!(
            store.get_product(bob, p.id).await,
            Err(StoreError::ProductNotFound)
        ));
        assert!(matches!(
            store.update_quantity(bob, p.id, 1).await,
            Err(StoreError::ProductNotFound)
        ));
        assert!(store.list_products(bob, 1, 10).await.is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_products() {
        let store = InventoryStore::new();
        let mut bad = phone(-1);
        assert!(matches!(
            store.insert_product(Uuid::new_v4(), bad.clone()).await,
            Err(StoreError::InvalidProduct)
        ));
        bad.quantity = 1;
        bad.sku = " ".into();
        assert!(matches!(
            store.insert_product(Uuid::new_v4(), bad).await,
            Err(StoreError::InvalidProduct)
        ));
    }

    #[tokio::test]
    async fn quantity_updates_and_extremes() {
        let store = InventoryStore::new();
        let owner = Uuid::new_v4();
        let a = store.insert_product(owner, phone(5)).await.unwrap();
        let b = store.insert_product(owner, phone(50)).await.unwrap();
        store.insert_product(Uuid::new_v4(), phone(500)).await.unwrap();

        assert_eq!(store.quantity_extreme(owner, Extreme::Most).await.unwrap().id, b.id);
        assert_eq!(store.quantity_extreme(owner, Extreme::Least).await.unwrap().id, a.id);

        let updated = store.update_quantity(owner, a.id, 99).await.unwrap();
        assert_eq!(updated.quantity, 99);
        assert_eq!(store.quantity_extreme(owner, Extreme::Most).await.unwrap().id, a.id);

        assert!(matches!(
            store.update_quantity(owner, a.id, -2).await,
            Err(StoreError::InvalidQuantity)
        ));
    }

    #[tokio::test]
    async fn pagination() {
        let store = InventoryStore::new();
        let owner = Uuid::new_v4();
        for q in 0..25 {
            store.insert_product(owner, phone(q)).await.unwrap();
        }
        assert_eq!(store.list_products(owner, 1, 10).await.len(), 10);
        assert_eq!(store.list_products(owner, 3, 10).await.len(), 5);
        assert!(store.list_products(owner, 4, 10).await.is_empty());
    }
}
