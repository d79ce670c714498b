//! PostgreSQL location/subscriber repository integration tests

#![cfg(feature = "postgres")]

use chrono::{Duration, Utc};
use sipcore::domain::location::{Binding, LocationRepository};
use sipcore::domain::subscriber::SubscriberRepository;
use sipcore::infrastructure::persistence::{
    create_pool, DatabaseConfig, PgLocationRepository, PgSubscriberRepository,
};
use sqlx::PgPool;

#[tokio::test]
#[ignore] // Requires database
async fn test_upsert_find_and_delete() {
    let pool = setup_database().await;
    let repo = PgLocationRepository::new(pool.clone());

    let binding = Binding::new("sip:test-alice@example.com", "sip:alice@192.0.2.10", 3600, "test-call", 1)
        .with_source("192.0.2.10:5060".parse().unwrap(), "udp");
    repo.upsert(&binding).await.expect("Failed to store binding");

    let mut refreshed = binding.clone();
    refreshed.cseq = 2;
    repo.upsert(&refreshed).await.expect("Failed to refresh binding");

    let found = repo.find("sip:test-alice@example.com").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].cseq, 2);
    assert_eq!(found[0].received, binding.received);
    assert_eq!(found[0].transport.as_deref(), Some("udp"));

    assert!(repo
        .delete("sip:test-alice@example.com", "sip:alice@192.0.2.10")
        .await
        .unwrap());
    assert!(repo.find("sip:test-alice@example.com").await.unwrap().is_empty());

    cleanup_database(pool).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_purge_expired() {
    let pool = setup_database().await;
    let repo = PgLocationRepository::new(pool.clone());

    let mut stale = Binding::new("sip:test-bob@example.com", "sip:bob@192.0.2.11", 60, "test-old", 1);
    stale.expires_at = Utc::now() - Duration::seconds(5);
    repo.upsert(&stale).await.unwrap();
    let live = Binding::new("sip:test-bob@example.com", "sip:bob@192.0.2.12", 60, "test-new", 1);
    repo.upsert(&live).await.unwrap();

    assert!(repo.purge_expired(Utc::now()).await.unwrap() >= 1);
    let remaining = repo.find("sip:test-bob@example.com").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].contact, "sip:bob@192.0.2.12");

    cleanup_database(pool).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_subscriber_lookup_ignores_domain_case() {
    let pool = setup_database().await;
    sqlx::query(
        "INSERT INTO subscriber (username, domain, password, ha1, enabled) \
         VALUES ('test-carol', 'example.com', 'secret', NULL, TRUE) \
         ON CONFLICT DO NOTHING",
    )
    .execute(&pool)
    .await
    .unwrap();

    let repo = PgSubscriberRepository::new(pool.clone());
    let subscriber = repo
        .find_by_username_and_domain("test-carol", "EXAMPLE.com")
        .await
        .unwrap()
        .expect("subscriber exists");
    assert_eq!(subscriber.password.as_deref(), Some("secret"));
    assert!(subscriber.enabled);

    cleanup_database(pool).await;
}

async fn setup_database() -> PgPool {
    let db_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/sipcore_test".to_string());

    let config = DatabaseConfig {
        url: db_url,
        max_connections: 5,
        min_connections: 1,
        connect_timeout: std::time::Duration::from_secs(10),
        idle_timeout: std::time::Duration::from_secs(60),
        max_lifetime: std::time::Duration::from_secs(300),
    };

    let pool = create_pool(&config).await.expect("Failed to create pool");

    // Tables are provisioned outside the proxy; create them for the test run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS location (
            aor TEXT NOT NULL,
            contact TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            call_id TEXT NOT NULL,
            cseq BIGINT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            received TEXT,
            transport TEXT,
            user_agent TEXT,
            PRIMARY KEY (aor, contact)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to create location table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriber (
            username TEXT NOT NULL,
            domain TEXT NOT NULL,
            password TEXT,
            ha1 TEXT,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            PRIMARY KEY (username, domain)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to create subscriber table");
    pool
}

async fn cleanup_database(pool: PgPool) {
    // Clean up test data
    sqlx::query("DELETE FROM location WHERE aor LIKE 'sip:test-%'")
        .execute(&pool)
        .await
        .ok();
    sqlx::query("DELETE FROM subscriber WHERE username LIKE 'test-%'")
        .execute(&pool)
        .await
        .ok();
    pool.close().await;
}
