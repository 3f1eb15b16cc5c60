//! SQLite access for the two stores the control daemon reads: the sensor
//! reading history (aggregate queries only — rows are appended by the
//! external ingestion service) and the operator settings table.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Mean of each measured quantity over a trailing time window. Fields are
/// `None` when no samples fall inside the window — decision code must treat
/// that as "no data", never as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedWindow {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub moisture: Option<f64>,
    pub sample_count: i64,
}

impl AveragedWindow {
    pub fn empty() -> Self {
        Self {
            temperature: None,
            humidity: None,
            co2: None,
            moisture: None,
            sample_count: 0,
        }
    }

    pub fn has_samples(&self) -> bool {
        self.sample_count > 0
    }
}

/// A settings value decoded from its stored text form: numeric parse first,
/// then case-insensitive true/false, else the raw string.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl SettingValue {
    pub fn decode(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(n) = trimmed.parse::<f64>() {
            return SettingValue::Number(n);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => SettingValue::Bool(true),
            "false" => SettingValue::Bool(false),
            _ => SettingValue::Text(raw.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SettingValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/garden/garden.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Reading history (aggregate only)
    // ----------------------------

    /// Average each sensor quantity over readings newer than `window_min`
    /// minutes. A single aggregate statement so the result is
    /// snapshot-consistent with respect to the concurrent ingestion writer.
    pub async fn average_since(&self, window_min: i64) -> Result<AveragedWindow> {
        let cutoff = now_unix() - window_min * 60;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*)         AS n,
                   AVG(temperature) AS avg_temp,
                   AVG(humidity)    AS avg_humidity,
                   AVG(co2)         AS avg_co2,
                   AVG(moisture)    AS avg_moisture
            FROM sensor_readings
            WHERE ts >= ?
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("average_since failed")?;

        Ok(AveragedWindow {
            temperature: row.get("avg_temp"),
            humidity: row.get("avg_humidity"),
            co2: row.get("avg_co2"),
            moisture: row.get("avg_moisture"),
            sample_count: row.get("n"),
        })
    }

    // ----------------------------
    // Settings
    // ----------------------------

    /// Fetch and decode a setting. `Ok(None)` means the setting is absent
    /// (the caller applies its documented default).
    pub async fn get_setting(&self, category: &str, key: &str) -> Result<Option<SettingValue>> {
        let row = sqlx::query(
            r#"
            SELECT value
            FROM system_settings
            WHERE category = ? AND key = ?
            "#,
        )
        .bind(category)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("get_setting {category}.{key} failed"))?;

        Ok(row.map(|r| SettingValue::decode(r.get("value"))))
    }

    /// Upsert a setting by (category, key), overwriting any existing value.
    pub async fn set_setting(&self, category: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (category, key, value, updated_at)
            VALUES (?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT(category, key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(category)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_setting {category}.{key} failed"))?;
        Ok(())
    }

    /// Numeric setting with fallback: absent or non-numeric values yield
    /// `default` so threshold comparisons always see a number.
    pub async fn setting_number(&self, category: &str, key: &str, default: f64) -> Result<f64> {
        Ok(self
            .get_setting(category, key)
            .await?
            .and_then(|v| v.as_number())
            .unwrap_or(default))
    }

    /// Text setting with fallback (used for the HH:MM schedule strings).
    pub async fn setting_text(&self, category: &str, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(category, key)
            .await?
            .and_then(|v| v.as_text().map(str::to_string))
            .unwrap_or_else(|| default.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    /// Insert a reading the way the external ingestion service would.
    async fn seed_reading(db: &Db, ts: i64, temperature: f64, humidity: f64, co2: f64, moisture: f64) {
        sqlx::query(
            "INSERT INTO sensor_readings (ts, temperature, humidity, co2, moisture) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ts)
        .bind(temperature)
        .bind(humidity)
        .bind(co2)
        .bind(moisture)
        .execute(db.pool())
        .await
        .unwrap();
    }

    // -- SettingValue decoding ---------------------------------------------

    #[test]
    fn decode_integer_as_number() {
        assert_eq!(SettingValue::decode("75"), SettingValue::Number(75.0));
    }

    #[test]
    fn decode_float_as_number() {
        assert_eq!(SettingValue::decode("29.5"), SettingValue::Number(29.5));
    }

    #[test]
    fn decode_true_case_insensitive() {
        assert_eq!(SettingValue::decode("TRUE"), SettingValue::Bool(true));
        assert_eq!(SettingValue::decode("true"), SettingValue::Bool(true));
    }

    #[test]
    fn decode_false_case_insensitive() {
        assert_eq!(SettingValue::decode("False"), SettingValue::Bool(false));
    }

    #[test]
    fn decode_hhmm_as_text() {
        assert_eq!(
            SettingValue::decode("06:00"),
            SettingValue::Text("06:00".to_string())
        );
    }

    #[test]
    fn decode_trims_before_numeric_parse() {
        assert_eq!(SettingValue::decode(" 42 "), SettingValue::Number(42.0));
    }

    // -- average_since ------------------------------------------------------

    #[tokio::test]
    async fn average_empty_table_has_no_samples() {
        let db = test_db().await;
        let avg = db.average_since(10).await.unwrap();
        assert_eq!(avg.sample_count, 0);
        assert!(!avg.has_samples());
        assert_eq!(avg.temperature, None);
        assert_eq!(avg.moisture, None);
    }

    #[tokio::test]
    async fn average_computes_means() {
        let db = test_db().await;
        let now = now_unix();
        seed_reading(&db, now - 60, 70.0, 50.0, 400.0, 20.0).await;
        seed_reading(&db, now - 30, 80.0, 60.0, 600.0, 40.0).await;

        let avg = db.average_since(10).await.unwrap();
        assert_eq!(avg.sample_count, 2);
        assert_eq!(avg.temperature, Some(75.0));
        assert_eq!(avg.humidity, Some(55.0));
        assert_eq!(avg.co2, Some(500.0));
        assert_eq!(avg.moisture, Some(30.0));
    }

    #[tokio::test]
    async fn average_excludes_readings_outside_window() {
        let db = test_db().await;
        let now = now_unix();
        seed_reading(&db, now - 3600, 100.0, 100.0, 9999.0, 0.0).await; // 1h old
        seed_reading(&db, now - 30, 70.0, 50.0, 400.0, 35.0).await;

        let avg = db.average_since(10).await.unwrap();
        assert_eq!(avg.sample_count, 1);
        assert_eq!(avg.temperature, Some(70.0));
    }

    #[tokio::test]
    async fn average_only_stale_readings_is_empty() {
        let db = test_db().await;
        let now = now_unix();
        seed_reading(&db, now - 7200, 70.0, 50.0, 400.0, 35.0).await;

        let avg = db.average_since(10).await.unwrap();
        assert_eq!(avg.sample_count, 0);
        assert_eq!(avg.moisture, None);
    }

    // -- Settings -----------------------------------------------------------

    #[tokio::test]
    async fn get_setting_missing_returns_none() {
        let db = test_db().await;
        assert_eq!(db.get_setting("temperature", "max").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_setting() {
        let db = test_db().await;
        db.set_setting("temperature", "max", "72").await.unwrap();
        assert_eq!(
            db.get_setting("temperature", "max").await.unwrap(),
            Some(SettingValue::Number(72.0))
        );
    }

    #[tokio::test]
    async fn set_setting_upserts_by_category_and_key() {
        let db = test_db().await;
        db.set_setting("moisture", "min", "30").await.unwrap();
        db.set_setting("moisture", "min", "45").await.unwrap();

        assert_eq!(
            db.get_setting("moisture", "min").await.unwrap(),
            Some(SettingValue::Number(45.0))
        );

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM system_settings")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn same_key_different_category_is_distinct() {
        let db = test_db().await;
        db.set_setting("temperature", "max", "75").await.unwrap();
        db.set_setting("humidity", "max", "80").await.unwrap();

        assert_eq!(
            db.setting_number("temperature", "max", 0.0).await.unwrap(),
            75.0
        );
        assert_eq!(db.setting_number("humidity", "max", 0.0).await.unwrap(), 80.0);
    }

    #[tokio::test]
    async fn setting_number_falls_back_when_absent() {
        let db = test_db().await;
        assert_eq!(db.setting_number("co2", "max", 1500.0).await.unwrap(), 1500.0);
    }

    #[tokio::test]
    async fn setting_number_falls_back_on_non_numeric_value() {
        let db = test_db().await;
        db.set_setting("co2", "max", "lots").await.unwrap();
        assert_eq!(db.setting_number("co2", "max", 1500.0).await.unwrap(), 1500.0);
    }

    #[tokio::test]
    async fn setting_text_reads_schedule_string() {
        let db = test_db().await;
        db.set_setting("light", "on_time", "05:30").await.unwrap();
        assert_eq!(
            db.setting_text("light", "on_time", "06:00").await.unwrap(),
            "05:30"
        );
    }

    #[tokio::test]
    async fn setting_text_falls_back_when_absent() {
        let db = test_db().await;
        assert_eq!(
            db.setting_text("light", "off_time", "20:00").await.unwrap(),
            "20:00"
        );
    }

    #[tokio::test]
    async fn setting_text_falls_back_when_value_is_numeric() {
        let db = test_db().await;
        // A bare number is not a valid schedule string.
        db.set_setting("light", "on_time", "600").await.unwrap();
        assert_eq!(
            db.setting_text("light", "on_time", "06:00").await.unwrap(),
            "06:00"
        );
    }
}
