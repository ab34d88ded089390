use ingest::batch::{BatchJob, BatchWriter, Pipeline, WriteStrategy};
use ingest::error::ErrorKind;
use ingest::row;
use ingest::test_utils::database::{TestDatabase, spawn_database, test_table_name};
use ingest::test_utils::schema::{
    asset_columns, assets_table, create_sites_and_assets, generate_assets, generate_sites,
    site_columns, sites_table,
};
use ingest::types::{Cell, TableName, TableRow};
use ingest_config::shared::BatchConfig;
use ingest_telemetry::tracing::init_test_tracing;

fn sites_job(table: TableName, rows: Vec<TableRow>) -> BatchJob {
    let mut job = BatchJob::new(table, site_columns()).unwrap();
    job.extend_rows(rows).unwrap();
    job
}

async fn create_sites_copy(database: &mut TestDatabase) -> TableName {
    let copy = test_table_name("sites_copy");
    database
        .run_sql(&format!(
            "create table {} (like {} including all)",
            copy.as_quoted_identifier(),
            sites_table().as_quoted_identifier()
        ))
        .await;
    copy
}

/// Counts rows present in one table but not the other, in both directions.
async fn symmetric_difference(database: &mut TestDatabase, a: &TableName, b: &TableName) -> i64 {
    let (a, b) = (a.as_quoted_identifier(), b.as_quoted_identifier());
    database
        .query_scalar(&format!(
            "select count(*) from ((select * from {a} except all select * from {b})
             union all (select * from {b} except all select * from {a})) as difference"
        ))
        .await
}

#[tokio::test(flavor = "multi_thread")]
async fn inline_and_streaming_writes_store_the_same_rows() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let copy = create_sites_copy(&mut database).await;
    let pool = database.open_pool(2).await;
    let writer = BatchWriter::default();

    let rows = generate_sites(1_500, 42);
    let mut conn = pool.acquire_default().await.unwrap();

    let inline = writer
        .write(
            &mut conn,
            &sites_job(sites_table(), rows.clone()),
            Some(WriteStrategy::Inline),
        )
        .await
        .unwrap();
    let streamed = writer
        .write(
            &mut conn,
            &sites_job(copy.clone(), rows),
            Some(WriteStrategy::Streaming),
        )
        .await
        .unwrap();
    conn.release();

    assert_eq!(inline, 1_500);
    assert_eq!(streamed, 1_500);
    assert_eq!(database.count_rows(&copy).await, 1_500);
    assert_eq!(symmetric_difference(&mut database, &sites_table(), &copy).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn nulls_and_json_survive_both_strategies() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let writer = BatchWriter::default();

    let mut sites = BatchJob::new(sites_table(), site_columns()).unwrap();
    sites.extend_rows(generate_sites(10, 1)).unwrap();

    let assets = generate_assets(200, 10, 1);
    let (inline_rows, streamed_rows) = assets.split_at(100);
    let mut inline_job = BatchJob::new(assets_table(), asset_columns()).unwrap();
    inline_job.extend_rows(inline_rows.to_vec()).unwrap();
    let mut streamed_job = BatchJob::new(assets_table(), asset_columns())
        .unwrap()
        .with_strategy(WriteStrategy::Streaming);
    streamed_job.extend_rows(streamed_rows.to_vec()).unwrap();

    let mut conn = pool.acquire_default().await.unwrap();
    writer.write(&mut conn, &sites, None).await.unwrap();
    writer.write(&mut conn, &inline_job, None).await.unwrap();
    writer.write(&mut conn, &streamed_job, None).await.unwrap();
    conn.release();

    let expected_nulls = assets
        .iter()
        .filter(|row| row.values()[4].is_null())
        .count() as i64;
    let table = assets_table().as_quoted_identifier();
    assert_eq!(
        database
            .query_scalar(&format!("select count(*) from {table} where temperature is null"))
            .await,
        expected_nulls
    );
    assert_eq!(
        database
            .query_scalar(&format!(
                "select count(*) from {table} where (metadata ->> 'site')::bigint = site_id"
            ))
            .await,
        200
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn inline_write_spanning_several_statements_is_atomic() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let writer = BatchWriter::default();

    // Four columns fit 16 383 rows per statement, so this job needs two statements and the
    // duplicate sits in the second one.
    let mut rows = generate_sites(20_000, 3);
    rows.push(rows[0].clone());

    let mut conn = pool.acquire_default().await.unwrap();
    let err = writer
        .write(
            &mut conn,
            &sites_job(sites_table(), rows),
            Some(WriteStrategy::Inline),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert!(!conn.is_broken());
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_streaming_write_leaves_table_untouched() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let writer = BatchWriter::default();

    let mut rows = generate_sites(5_000, 9);
    rows.push(rows[10].clone());

    let mut conn = pool.acquire_default().await.unwrap();
    let err = writer
        .write(&mut conn, &sites_job(sites_table(), rows), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_cell_type_is_rejected() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let writer = BatchWriter::default();

    let mut job = BatchJob::new(sites_table(), site_columns()).unwrap();
    job.push_row(row!["not an id", "north-1", "north", Cell::Null]).unwrap();

    let mut conn = pool.acquire_default().await.unwrap();
    let err = writer.write(&mut conn, &job, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConversionError);
    assert!(!conn.is_broken());
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pipelined_write_reports_each_failed_row() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let writer = BatchWriter::default();

    let sites = generate_sites(3, 5);
    let rows = vec![
        sites[0].clone(),
        sites[1].clone(),
        sites[1].clone(),
        sites[2].clone(),
    ];
    let job = sites_job(sites_table(), rows);

    let mut conn = pool.acquire_default().await.unwrap();
    let report = writer.write_pipelined(&mut conn, &job).await;

    assert!(!report.is_success());
    assert_eq!(report.failed_indices(), vec![2]);
    assert_eq!(report.rows_affected(), 3);
    assert_eq!(
        report.outcomes()[2].error().unwrap().kind(),
        ErrorKind::ConstraintViolation
    );

    let err = report.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchPartialFailure);
    assert_eq!(
        err.kinds(),
        vec![ErrorKind::BatchPartialFailure, ErrorKind::ConstraintViolation]
    );
    assert!(err.detail().unwrap().contains("1 of 4 statements failed: [2]"));
    assert!(!conn.is_broken());
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_runs_mixed_statements() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;

    let table = sites_table().as_quoted_identifier();
    let insert = format!(
        "insert into {table} (id, name, region, created_at) values ($1, $2, $3, now())"
    );

    let mut pipeline = Pipeline::new();
    for id in 1..=5i64 {
        pipeline.queue(
            insert.clone(),
            vec![
                Cell::I64(id),
                Cell::String(format!("site-{id}")),
                Cell::from("east"),
            ],
        );
    }
    pipeline.queue(
        format!("update {table} set region = 'west' where id > $1"),
        vec![Cell::I64(100)],
    );
    pipeline.queue("select * from missing_table", vec![]);
    assert_eq!(pipeline.len(), 7);

    let mut conn = pool.acquire_default().await.unwrap();
    let report = pipeline.execute(&mut conn).await;
    conn.release();

    assert_eq!(report.failed_indices(), vec![6]);
    assert_eq!(
        report.outcomes()[6].error().unwrap().kind(),
        ErrorKind::SchemaError
    );
    assert_eq!(report.rows_affected(), 5);
    assert_eq!(database.count_rows(&sites_table()).await, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn automatic_selection_writes_small_and_large_batches() {
    init_test_tracing();
    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let writer = BatchWriter::new(BatchConfig {
        streaming_threshold_rows: 100,
    });

    let rows = generate_sites(150, 11);
    let (small, large) = rows.split_at(50);
    let small = sites_job(sites_table(), small.to_vec());
    let large = sites_job(sites_table(), large.to_vec());
    assert_eq!(writer.strategy_for(&small, None), WriteStrategy::Inline);
    assert_eq!(writer.strategy_for(&large, None), WriteStrategy::Streaming);

    let mut conn = pool.acquire_default().await.unwrap();
    assert_eq!(writer.write(&mut conn, &small, None).await.unwrap(), 50);
    assert_eq!(writer.write(&mut conn, &large, None).await.unwrap(), 100);

    let empty = sites_job(sites_table(), vec![]);
    assert_eq!(writer.write(&mut conn, &empty, None).await.unwrap(), 0);
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 150);
}
