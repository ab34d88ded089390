//! Sites and assets: the two tables the integration tests load and merge into.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::test_utils::database::{TestDatabase, test_table_name};
use crate::types::{Cell, ColumnSchema, TableName, TableRow, Type};

pub const ASSET_STATUSES: [&str; 3] = ["active", "maintenance", "retired"];

const REGIONS: [&str; 4] = ["north", "south", "east", "west"];

/// First `created_at` handed out by the generators.
const BASE_TIMESTAMP: i64 = 1_700_000_000;

pub fn sites_table() -> TableName {
    test_table_name("sites")
}

pub fn assets_table() -> TableName {
    test_table_name("assets")
}

/// Creates `test.sites` and `test.assets`.
pub async fn create_sites_and_assets(database: &mut TestDatabase) {
    database
        .run_sql(&format!(
            "create table {} (
                id bigint primary key,
                name text not null,
                region text not null,
                created_at timestamptz not null
            )",
            sites_table().as_quoted_identifier()
        ))
        .await;

    database
        .run_sql(&format!(
            "create table {} (
                id bigint primary key,
                site_id bigint not null references {} (id),
                serial text not null unique,
                status text not null,
                temperature double precision,
                metadata jsonb
            )",
            assets_table().as_quoted_identifier(),
            sites_table().as_quoted_identifier()
        ))
        .await;
}

pub fn site_columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::new("id", Type::INT8),
        ColumnSchema::new("name", Type::TEXT),
        ColumnSchema::new("region", Type::TEXT),
        ColumnSchema::new("created_at", Type::TIMESTAMPTZ),
    ]
}

pub fn asset_columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::new("id", Type::INT8),
        ColumnSchema::new("site_id", Type::INT8),
        ColumnSchema::new("serial", Type::TEXT),
        ColumnSchema::new("status", Type::TEXT),
        ColumnSchema::new("temperature", Type::FLOAT8),
        ColumnSchema::new("metadata", Type::JSONB),
    ]
}

fn timestamp(offset: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(BASE_TIMESTAMP + offset, 0).expect("timestamp is in range")
}

/// Generates sites with ids `1..=count`. The same seed yields the same rows.
pub fn generate_sites(count: usize, seed: u64) -> Vec<TableRow> {
    let mut rng = StdRng::seed_from_u64(seed);

    (1..=count as i64)
        .map(|id| {
            let region = REGIONS[rng.gen_range(0..REGIONS.len())];
            TableRow::new(vec![
                Cell::I64(id),
                Cell::String(format!("site-{id}")),
                Cell::from(region),
                Cell::TimestampTz(timestamp(id)),
            ])
        })
        .collect()
}

/// Generates assets with ids `1..=count`, each attached to one of `site_count` sites.
pub fn generate_assets(count: usize, site_count: usize, seed: u64) -> Vec<TableRow> {
    let mut rng = StdRng::seed_from_u64(seed);

    (1..=count as i64)
        .map(|id| {
            let site_id = rng.gen_range(1..=site_count as i64);
            let status = ASSET_STATUSES[rng.gen_range(0..ASSET_STATUSES.len())];
            // Some assets have no reading yet.
            let temperature = if rng.gen_bool(0.9) {
                Cell::F64(rng.gen_range(-20.0..60.0))
            } else {
                Cell::Null
            };

            TableRow::new(vec![
                Cell::I64(id),
                Cell::I64(site_id),
                Cell::String(format!("SN-{id:08}")),
                Cell::from(status),
                temperature,
                Cell::Json(serde_json::json!({ "firmware": rng.gen_range(1..5), "site": site_id })),
            ])
        })
        .collect()
}
