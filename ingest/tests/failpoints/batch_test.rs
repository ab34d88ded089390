use ingest::batch::{BatchJob, BatchWriter, WriteStrategy};
use ingest::error::ErrorKind;
use ingest::failpoints::BATCH_BEFORE_COPY_FINISH;
use ingest::test_utils::database::spawn_database;
use ingest::test_utils::failpoints::CustomFailScenario;
use ingest::test_utils::schema::{
    create_sites_and_assets, generate_sites, site_columns, sites_table,
};
use ingest_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_copy_writes_nothing() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(BATCH_BEFORE_COPY_FINISH, "return")]);

    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;

    let mut job = BatchJob::new(sites_table(), site_columns()).unwrap();
    job.extend_rows(generate_sites(2_000, 4)).unwrap();

    let mut conn = pool.acquire_default().await.unwrap();
    let err = BatchWriter::default()
        .write(&mut conn, &job, Some(WriteStrategy::Streaming))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryFailed);
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_lost_during_copy_discards_the_session() {
    init_test_tracing();
    let _scenario =
        CustomFailScenario::setup(&[(BATCH_BEFORE_COPY_FINISH, "return(connection_lost)")]);

    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;

    let mut job = BatchJob::new(sites_table(), site_columns()).unwrap();
    job.extend_rows(generate_sites(2_000, 4)).unwrap();

    let mut conn = pool.acquire_default().await.unwrap();
    let err = BatchWriter::default()
        .write(&mut conn, &job, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert!(conn.is_broken());
    let lost_id = conn.id();
    conn.release();

    let conn = pool.acquire_default().await.unwrap();
    assert_ne!(conn.id(), lost_id);
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 0);
}
