use ingest::error::ErrorKind;
use ingest::failpoints::TRANSACTION_ROLLBACK;
use ingest::test_utils::database::spawn_database;
use ingest::test_utils::failpoints::CustomFailScenario;
use ingest::test_utils::schema::{create_sites_and_assets, sites_table};
use ingest::transaction::ScopedTransaction;
use ingest_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn failed_rollback_keeps_the_original_error_first() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(TRANSACTION_ROLLBACK, "return(connection_lost)")]);

    let mut database = spawn_database().await;
    create_sites_and_assets(&mut database).await;
    let pool = database.open_pool(1).await;
    let mut conn = pool.acquire_default().await.unwrap();

    let sql = format!(
        "insert into {} (id, name, region, created_at) values ($1, 'north-1', 'north', now())",
        sites_table().as_quoted_identifier()
    );
    let err = ScopedTransaction::run(&mut conn, async |tx| {
        tx.execute(sql.as_str(), &[&1i64]).await?;
        tx.execute(sql.as_str(), &[&1i64]).await?;
        Ok(())
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(
        err.kinds(),
        vec![ErrorKind::ConstraintViolation, ErrorKind::ConnectionLost]
    );
    assert_eq!(err.errors().map(<[_]>::len), Some(2));

    // A session whose rollback failed is not handed out again.
    assert!(conn.is_broken());
    let broken_id = conn.id();
    conn.release();

    let conn = pool.acquire_default().await.unwrap();
    assert_ne!(conn.id(), broken_id);
    conn.release();

    assert_eq!(database.count_rows(&sites_table()).await, 0);
}
