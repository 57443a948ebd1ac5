use sqlx::SqlitePool;

/// A destination row (§3 `Destination`) as read by the destination cache
/// (C14) on a cache miss or freshness probe.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DestinationRow {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub status: String,
    pub updated_at: String,
}

/// A campaign row (§3 `Campaign`), the join key between a resolved rule
/// bundle and its platform (C15).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CampaignRow {
    pub id: String,
    pub user_id: String,
    pub site_id: String,
    pub platform_id: Option<String>,
    pub kv_key: String,
    pub name: String,
}

/// A platform row (§3 `Platform`): the postback template's click-id
/// parameter name lives here.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlatformRow {
    pub id: String,
    pub name: String,
    pub click_id_param: String,
}

/// The control-plane database collaborator (§6): destinations, campaigns and
/// platforms are read-mostly, written by an out-of-scope management surface.
/// This engine only ever reads them.
pub struct ControlDb {
    pool: SqlitePool,
}

impl ControlDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS destinations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                url TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                site_id TEXT NOT NULL,
                platform_id TEXT,
                kv_key TEXT NOT NULL,
                name TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS platforms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                click_id_param TEXT NOT NULL DEFAULT 'click_id'
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_destination(&self, id: &str) -> Result<Option<DestinationRow>, sqlx::Error> {
        sqlx::query_as("SELECT id, user_id, url, status, updated_at FROM destinations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_campaign(&self, id: &str) -> Result<Option<CampaignRow>, sqlx::Error> {
        sqlx::query_as("SELECT id, user_id, site_id, platform_id, kv_key, name FROM campaigns WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_platform(&self, id: &str) -> Result<Option<PlatformRow>, sqlx::Error> {
        sqlx::query_as("SELECT id, name, click_id_param FROM platforms WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seeded_db() -> ControlDb {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        ControlDb::migrate(&pool).await.unwrap();
        sqlx::query("INSERT INTO destinations (id, user_id, url, status) VALUES ('d1','u1','https://a.example','active')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO campaigns (id, user_id, site_id, platform_id, kv_key, name) VALUES ('c1','u1','s1','p1','k1','Camp One')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO platforms (id, name, click_id_param) VALUES ('p1','ExamplePlatform','clickid')")
            .execute(&pool)
            .await
            .unwrap();
        ControlDb::new(pool)
    }

    #[tokio::test]
    async fn reads_seeded_rows() {
        let db = seeded_db().await;
        let dest = db.get_destination("d1").await.unwrap().unwrap();
        assert_eq!(dest.url, "https://a.example");

        let camp = db.get_campaign("c1").await.unwrap().unwrap();
        assert_eq!(camp.platform_id.as_deref(), Some("p1"));

        let platform = db.get_platform("p1").await.unwrap().unwrap();
        assert_eq!(platform.click_id_param, "clickid");
    }

    #[tokio::test]
    async fn missing_row_is_none() {
        let db = seeded_db().await;
        assert!(db.get_destination("nope").await.unwrap().is_none());
    }
}
