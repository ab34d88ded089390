use ingest::batch::{BatchJob, BatchWriter};
use ingest::error::ErrorKind;
use ingest::merge::{MergeCoordinator, MergeRequest, MergeUpdate};
use ingest::pool::PgPool;
use ingest::row;
use ingest::test_utils::database::{TestDatabase, spawn_database, test_table_name};
use ingest::test_utils::schema::{
    asset_columns, assets_table, create_sites_and_assets, generate_assets, generate_sites,
    site_columns, sites_table,
};
use ingest::types::{Cell, TableRow};
use ingest_telemetry::tracing::init_test_tracing;

/// Loads 10 sites and 100 assets and returns the asset rows.
async fn load_fixture(pool: &PgPool) -> Vec<TableRow> {
    let writer = BatchWriter::default();
    let mut conn = pool.acquire_default().await.unwrap();

    let mut sites = BatchJob::new(sites_table(), site_columns()).unwrap();
    sites.extend_rows(generate_sites(10, 21)).unwrap();
    writer.write(&mut conn, &sites, None).await.unwrap();

    let assets = generate_assets(100, 10, 21);
    let mut job = BatchJob::new(assets_table(), asset_columns()).unwrap();
    job.extend_rows(assets.clone()).unwrap();
    writer.write(&mut conn, &job, None).await.unwrap();

    assets
}

fn status_request(rows: Vec<TableRow>) -> MergeRequest {
    MergeRequest::new(
        assets_table(),
        vec!["id".into(), "status".into()],
        vec!["id".into()],
    )
    .with_rows(rows)
}

async fn count_with_status(database: &mut TestDatabase, status: &str) -> i64 {
    database
        .query_scalar(&format!(
            "select count(*) from {} where status = '{status}'",
            assets_table().as_quoted_identifier()
        ))
        .await
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_updates_only_matching_rows() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    load_fixture(&pool).await;

    // Ten existing assets and five ids that do not exist.
    let rows = (1..=10i64)
        .chain(1_001..=1_005)
        .map(|id| row![id, "decommissioned"])
        .collect();

    let mut conn = pool.acquire_default().await.unwrap();
    let updated = MergeCoordinator::new()
        .merge(&mut conn, &status_request(rows))
        .await
        .unwrap();
    conn.release();

    assert_eq!(updated, 10);
    assert_eq!(count_with_status(&mut database, "decommissioned").await, 10);
    assert_eq!(database.count_rows(&assets_table()).await, 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeating_a_merge_leaves_the_same_state() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    load_fixture(&pool).await;

    let request = MergeRequest::new(
        assets_table(),
        vec!["id".into(), "status".into(), "temperature".into()],
        vec!["id".into()],
    )
    .with_rows((1..=50i64).map(|id| row![id, "maintenance", 21.5f64]).collect());

    let table = assets_table().as_quoted_identifier();
    let snapshot = format!(
        "select count(*) from {table} where status = 'maintenance' and temperature = 21.5"
    );

    let coordinator = MergeCoordinator::new();
    let mut conn = pool.acquire_default().await.unwrap();
    assert_eq!(coordinator.merge(&mut conn, &request).await.unwrap(), 50);
    let after_first = database.query_scalar(&snapshot).await;

    assert_eq!(coordinator.merge(&mut conn, &request).await.unwrap(), 50);
    let after_second = database.query_scalar(&snapshot).await;
    conn.release();

    assert_eq!(after_first, 50);
    assert_eq!(after_first, after_second);
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_with_composite_key_and_expression() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let assets = load_fixture(&pool).await;

    // Half the rows carry the asset's real site, half a wrong one that must not match.
    let rows = assets
        .iter()
        .map(|asset| {
            let (Cell::I64(id), Cell::I64(site_id)) = (&asset.values()[0], &asset.values()[1])
            else {
                panic!("asset ids are integers");
            };
            let site_id = if id % 2 == 0 { *site_id } else { -1 };
            row![*id, site_id, 5.0f64]
        })
        .collect();

    let request = MergeRequest::new(
        assets_table(),
        vec!["id".into(), "site_id".into(), "temperature".into()],
        vec!["id".into(), "site_id".into()],
    )
    .with_rows(rows)
    .with_update(MergeUpdate::Expression(
        "temperature = coalesce(t.temperature, 0) + s.temperature, status = 'active'".into(),
    ));

    let mut conn = pool.acquire_default().await.unwrap();
    let updated = MergeCoordinator::new().merge(&mut conn, &request).await.unwrap();
    conn.release();

    assert_eq!(updated, 50);
    assert_eq!(
        database
            .query_scalar(&format!(
                "select count(*) from {} where id % 2 = 0 and status = 'active'",
                assets_table().as_quoted_identifier()
            ))
            .await,
        50
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_merge_changes_nothing_and_drops_staging() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    load_fixture(&pool).await;

    // Moving assets to a site that does not exist violates the foreign key.
    let request = MergeRequest::new(
        assets_table(),
        vec!["id".into(), "site_id".into()],
        vec!["id".into()],
    )
    .with_rows((1..=10i64).map(|id| row![id, 999i64]).collect())
    .with_update(MergeUpdate::Columns(vec!["site_id".into()]));

    let mut conn = pool.acquire_default().await.unwrap();
    let err = MergeCoordinator::new()
        .merge(&mut conn, &request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);

    let staging_tables: i64 = conn
        .client()
        .query_one(
            "select count(*) from pg_tables where tablename like 'ingest_staging_%'",
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(staging_tables, 0);
    conn.release();

    assert_eq!(
        database
            .query_scalar(&format!(
                "select count(*) from {} where site_id = 999",
                assets_table().as_quoted_identifier()
            ))
            .await,
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_into_missing_table_is_a_schema_error() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;

    let request = MergeRequest::new(
        test_table_name("missing"),
        vec!["id".into(), "status".into()],
        vec!["id".into()],
    )
    .with_rows(vec![row![1i64, "active"]]);

    let mut conn = pool.acquire_default().await.unwrap();
    let err = MergeCoordinator::new()
        .merge(&mut conn, &request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaError);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_merge_is_a_no_op() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;

    let mut conn = pool.acquire_default().await.unwrap();
    let updated = MergeCoordinator::new()
        .merge(&mut conn, &status_request(vec![]))
        .await
        .unwrap();
    conn.release();

    assert_eq!(updated, 0);
    assert_eq!(count_with_status(&mut database, "active").await, 0);
}
