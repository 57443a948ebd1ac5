//! Test-only KV/DB seeding. Not an HTTP surface — exists so integration-
//! shaped tests can stand up a realistic bundle/campaign/destination graph
//! in a couple of calls instead of hand-writing SQL and JSON inline.
#![cfg(test)]

use crate::db::ControlDb;
use crate::kv::{KvStore, SqliteKv};
use crate::rules::RuleBundle;
use sqlx::SqlitePool;

pub async fn in_memory_pool() -> SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool")
}

pub async fn seeded_kv(pool: &SqlitePool) -> SqliteKv {
    SqliteKv::migrate(pool).await.expect("kv migration");
    SqliteKv::new(pool.clone())
}

pub async fn put_bundle(kv: &SqliteKv, key: &str, bundle: &RuleBundle) {
    let json = serde_json::to_string(bundle).expect("bundle serializes");
    kv.put(key, &json).await.expect("kv put");
}

pub async fn seeded_control_db(pool: &SqlitePool) -> ControlDb {
    ControlDb::migrate(pool).await.expect("control db migration");
    ControlDb::new(pool.clone())
}

pub async fn insert_destination(pool: &SqlitePool, id: &str, url: &str, status: &str) {
    sqlx::query("INSERT INTO destinations (id, user_id, url, status) VALUES (?1, 'u1', ?2, ?3)")
        .bind(id)
        .bind(url)
        .bind(status)
        .execute(pool)
        .await
        .expect("insert destination");
}

pub async fn insert_campaign(pool: &SqlitePool, id: &str, platform_id: Option<&str>) {
    sqlx::query("INSERT INTO campaigns (id, user_id, site_id, platform_id, kv_key, name) VALUES (?1, 'u1', 's1', ?2, ?3, ?1)")
        .bind(id)
        .bind(platform_id)
        .bind(format!("{id}.kv"))
        .execute(pool)
        .await
        .expect("insert campaign");
}

pub async fn insert_platform(pool: &SqlitePool, id: &str, name: &str, click_id_param: &str) {
    sqlx::query("INSERT INTO platforms (id, name, click_id_param) VALUES (?1, ?2, ?3)")
        .bind(id)
        .bind(name)
        .bind(click_id_param)
        .execute(pool)
        .await
        .expect("insert platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;

    #[tokio::test]
    async fn seeds_a_bundle_resolvable_through_the_kv_store() {
        let pool = in_memory_pool().await;
        let kv = seeded_kv(&pool).await;
        let bundle = RuleBundle {
            id: "b1".into(),
            rules: vec![Rule::default()],
            ..Default::default()
        };
        put_bundle(&kv, "example.com/", &bundle).await;

        let raw = kv.get("example.com/").await.unwrap().unwrap();
        let decoded: RuleBundle = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.id, "b1");
    }

    #[tokio::test]
    async fn seeds_campaign_platform_destination_graph() {
        let pool = in_memory_pool().await;
        let db = seeded_control_db(&pool).await;
        insert_platform(&pool, "p1", "ExamplePlatform", "clickid").await;
        insert_campaign(&pool, "c1", Some("p1")).await;
        insert_destination(&pool, "d1", "https://advertiser.example", "active").await;

        assert!(db.get_campaign("c1").await.unwrap().is_some());
        assert!(db.get_platform("p1").await.unwrap().is_some());
        assert!(db.get_destination("d1").await.unwrap().is_some());
    }
}
