//! Product catalog lookups used to annotate detections.

use sqlx::{PgPool, Postgres};

use crate::models::Product;

const PRODUCT_COLUMNS: &str =
    "id, ean, upc, ean8, additional_codes, name, brand, active, created_at, updated_at";

/// Find an active product by any of its codes (primary EAN, UPC, EAN-8 or an
/// additional code).
pub async fn get_by_any_code(pool: &PgPool, code: &str) -> Result<Option<Product>, sqlx::Error> {
    sqlx::query_as::<Postgres, Product>(&format!(
        r#"
        SELECT {PRODUCT_COLUMNS} FROM products
        WHERE active
          AND (ean = $1 OR upc = $1 OR ean8 = $1 OR $1 = ANY(additional_codes))
        LIMIT 1
        "#,
    ))
    .bind(code)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_ean(pool: &PgPool, ean: &str) -> Result<Option<Product>, sqlx::Error> {
    sqlx::query_as::<Postgres, Product>(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE ean = $1"
    ))
    .bind(ean)
    .fetch_optional(pool)
    .await
}
