use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A catalog product, addressable by any of its barcodes.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub ean: String,
    pub upc: Option<String>,
    pub ean8: Option<String>,
    pub additional_codes: Vec<String>,
    pub name: String,
    pub brand: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn has_code(&self, code: &str) -> bool {
        self.ean == code
            || self.upc.as_deref() == Some(code)
            || self.ean8.as_deref() == Some(code)
            || self.additional_codes.iter().any(|c| c == code)
    }
}
