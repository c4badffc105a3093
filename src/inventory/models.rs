use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub sku: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub description: String,
    pub quantity: i64,
    pub price: f64,
}

impl NewProduct {
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
            && !self.sku.trim().is_empty()
            && self.quantity >= 0
            && self.price >= 0.0
            && self.price.is_finite()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sku: String,
    pub image_url: String,
    pub description: String,
    pub quantity: i64,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct QuantityUpdateRequest {
    pub quantity: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub pagenum: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ProductIdQuery {
    pub product_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtremeQuery {
    #[serde(default)]
    pub most: bool,
    #[serde(default)]
    pub least: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Most,
    Least,
}
