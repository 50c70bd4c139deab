//! Device addresses from Kismet SQLite captures.

use std::path::Path;

use async_trait::async_trait;
use macwatch_core::{DeviceSource, IngestError, Result};
use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tracing::debug;

/// One row per access point, dropping devices never actually heard.
const ACCESS_POINTS_SQL: &str = "SELECT DISTINCT devmac FROM devices \
     WHERE type = 'Wi-Fi AP' AND strongest_signal <> 0 \
     ORDER BY devmac";

#[derive(Debug, Clone, Copy, Default)]
pub struct KismetSource;

#[async_trait]
impl DeviceSource for KismetSource {
    async fn device_addresses(&self, path: &Path) -> Result<Vec<String>> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);

        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|err| {
                IngestError::processing(path, format!("cannot open capture: {err}"))
            })?;

        let addresses: Vec<String> = sqlx::query_scalar(ACCESS_POINTS_SQL)
            .fetch_all(&mut conn)
            .await
            .map_err(|err| {
                IngestError::processing(path, format!("device query failed: {err}"))
            })?;

        if let Err(err) = conn.close().await {
            debug!(path = %path.display(), error = %err, "capture close failed");
        }

        debug!(
            path = %path.display(),
            devices = addresses.len(),
            "read access points from capture"
        );
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture(path: &Path) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query(
            "CREATE TABLE devices (devmac TEXT, type TEXT, strongest_signal INTEGER)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        for (mac, kind, signal) in [
            ("A4:83:E7:00:00:01", "Wi-Fi AP", -40),
            ("A4:83:E7:00:00:01", "Wi-Fi AP", -70),
            ("00:1B:54:00:00:02", "Wi-Fi AP", -55),
            ("3C:A9:F4:00:00:03", "Wi-Fi Client", -30),
            ("DE:AD:BE:00:00:04", "Wi-Fi AP", 0),
        ] {
            sqlx::query(
                "INSERT INTO devices (devmac, type, strongest_signal) VALUES (?, ?, ?)",
            )
            .bind(mac)
            .bind(kind)
            .bind(signal)
            .execute(&mut conn)
            .await
            .unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn reads_heard_access_points_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drive.kismet");
        fixture(&path).await;

        let addresses = KismetSource.device_addresses(&path).await.unwrap();
        assert_eq!(addresses, vec!["00:1B:54:00:00:02", "A4:83:E7:00:00:01"]);
    }

    #[tokio::test]
    async fn non_database_is_a_processing_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.kismet");
        std::fs::write(&path, b"definitely not sqlite").unwrap();

        let err = KismetSource.device_addresses(&path).await.unwrap_err();
        assert!(matches!(err, IngestError::Processing { .. }));
    }
}
