//! Per-file enrichment: resolve the vendor of every device in a capture and
//! write a report next to it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::error::{IngestError, Result};
use crate::lookup::{
    LookupOutcome, MacVendorsProvider, RateLimitedClient, VendorKey,
    VendorService,
};
use crate::queue::worker::FileProcessor;
use crate::watch::relocate;

/// Extracts device hardware addresses from a capture file.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Raw hardware addresses of the devices recorded in `path`.
    async fn device_addresses(&self, path: &Path) -> Result<Vec<String>>;
}

/// One device from the capture and what its prefix resolved to.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceVendor {
    /// Address as read from the capture.
    pub address: String,
    /// Normalised `AA-BB-CC` prefix that was looked up.
    pub prefix: String,
    /// Lookup result, flattened into the device object.
    #[serde(flatten)]
    pub lookup: LookupOutcome,
}

/// Per-capture counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportSummary {
    /// Devices read from the capture.
    pub devices: usize,
    /// Devices with a vendor name.
    pub resolved: usize,
    /// Devices whose prefix has no registered vendor.
    pub not_found: usize,
    /// Skipped, deferred, timed out or failed lookups.
    pub unresolved: usize,
    /// Addresses that could not be parsed.
    pub invalid_addresses: usize,
}

/// JSON report written for each processed capture.
#[derive(Debug, Clone, Serialize)]
pub struct VendorReport {
    /// File name of the capture.
    pub capture: String,
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// Counts over `devices`.
    pub summary: ReportSummary,
    /// One entry per parseable address.
    pub devices: Vec<DeviceVendor>,
}

/// Where reports and finished captures go, resolved against the watch root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    /// Always set; defaults to the watch root.
    pub report_dir: PathBuf,
    /// Captures are left in place when unset.
    pub processed_dir: Option<PathBuf>,
    /// Failed captures are left in place when unset.
    pub failed_dir: Option<PathBuf>,
}

impl OutputLayout {
    /// Fill unset directories from the watch root.
    pub fn resolve(output: &OutputConfig, watch_root: &Path) -> Self {
        Self {
            report_dir: output
                .report_dir
                .clone()
                .unwrap_or_else(|| watch_root.to_path_buf()),
            processed_dir: output.processed_dir.clone(),
            failed_dir: output.failed_dir.clone(),
        }
    }

    /// `<report_dir>/<stem>.vendors.json`
    pub fn report_path(&self, capture: &Path) -> PathBuf {
        let stem = capture
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture".to_string());
        self.report_dir.join(format!("{stem}.vendors.json"))
    }
}

/// [`FileProcessor`] that enriches a capture's devices with vendor names.
pub struct EnrichmentProcessor<D, S = MacVendorsProvider> {
    source: D,
    client: Arc<RateLimitedClient<S>>,
    layout: OutputLayout,
}

impl<D, S> fmt::Debug for EnrichmentProcessor<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichmentProcessor")
            .field("source", &std::any::type_name::<D>())
            .field("client", &self.client)
            .field("layout", &self.layout)
            .finish()
    }
}

impl<D, S> EnrichmentProcessor<D, S>
where
    D: DeviceSource,
    S: VendorService,
{
    /// Processor reading devices from `source` and resolving them through
    /// `client`.
    pub fn new(
        source: D,
        client: Arc<RateLimitedClient<S>>,
        layout: OutputLayout,
    ) -> Self {
        Self {
            source,
            client,
            layout,
        }
    }

    /// Resolved output directories.
    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Look up every address in the capture and build the report.
    pub async fn enrich(&self, path: &Path) -> Result<VendorReport> {
        let addresses = self.source.device_addresses(path).await?;

        let mut summary = ReportSummary {
            devices: addresses.len(),
            ..Default::default()
        };
        let mut parsed = Vec::with_capacity(addresses.len());
        for address in addresses {
            match VendorKey::parse(&address) {
                Ok(key) => parsed.push((address, key)),
                Err(_) => {
                    debug!(address = %address, "skipping malformed address");
                    summary.invalid_addresses += 1;
                }
            }
        }

        let keys: Vec<VendorKey> =
            parsed.iter().map(|(_, key)| key.clone()).collect();
        let mut outcomes: HashMap<VendorKey, LookupOutcome> =
            self.client.lookup_batch(&keys).await.into_iter().collect();
        outcomes.extend(self.client.retry_deferred().await);

        let mut devices = Vec::with_capacity(parsed.len());
        for (address, key) in parsed {
            let lookup = outcomes
                .get(&key)
                .cloned()
                .unwrap_or(LookupOutcome::Skipped);
            match &lookup {
                LookupOutcome::Found(_) => summary.resolved += 1,
                LookupOutcome::NotFound => summary.not_found += 1,
                _ => summary.unresolved += 1,
            }
            devices.push(DeviceVendor {
                address,
                prefix: key.to_string(),
                lookup,
            });
        }

        Ok(VendorReport {
            capture: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            generated_at: Utc::now(),
            summary,
            devices,
        })
    }

    async fn write_report(
        &self,
        capture: &Path,
        report: &VendorReport,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.layout.report_dir).await?;
        let target = self.layout.report_path(capture);
        let body = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&target, body).await?;
        Ok(target)
    }

    async fn finish(&self, path: &Path, report: &VendorReport) -> Result<()> {
        let written = self.write_report(path, report).await?;
        info!(
            file = %report.capture,
            devices = report.summary.devices,
            resolved = report.summary.resolved,
            not_found = report.summary.not_found,
            unresolved = report.summary.unresolved,
            report = %written.display(),
            "vendor report written"
        );

        if let Some(dir) = &self.layout.processed_dir {
            relocate(path, dir).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<D, S> FileProcessor for EnrichmentProcessor<D, S>
where
    D: DeviceSource,
    S: VendorService,
{
    async fn process(&self, path: &Path) -> Result<()> {
        let result = match self.enrich(path).await {
            Ok(report) => self.finish(path, &report).await,
            Err(err) => Err(err),
        };

        let Err(err) = result else {
            return Ok(());
        };

        if let Some(dir) = &self.layout.failed_dir
            && let Err(move_err) = relocate(path, dir).await
        {
            warn!(
                file = %path.display(),
                error = %move_err,
                "could not move failed capture"
            );
        }
        if matches!(err, IngestError::Processing { .. }) {
            Err(err)
        } else {
            Err(IngestError::processing(path, err.to_string()))
        }
    }

    async fn is_processed(&self, path: &Path) -> bool {
        if let (Some(dir), Some(name)) =
            (&self.layout.processed_dir, path.file_name())
            && tokio::fs::try_exists(dir.join(name)).await.unwrap_or(false)
        {
            return true;
        }
        tokio::fs::try_exists(self.layout.report_path(path))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookupConfig;
    use crate::lookup::ProviderError;
    use tempfile::TempDir;

    struct FixedSource(Vec<&'static str>);

    #[async_trait]
    impl DeviceSource for FixedSource {
        async fn device_addresses(&self, path: &Path) -> Result<Vec<String>> {
            if path.to_string_lossy().contains("corrupt") {
                return Err(IngestError::processing(path, "not a database"));
            }
            Ok(self.0.iter().map(|addr| addr.to_string()).collect())
        }
    }

    struct TableService;

    #[async_trait]
    impl VendorService for TableService {
        async fn lookup(&self, key: &str) -> std::result::Result<String, ProviderError> {
            match key {
                "A4-83-E7" => Ok("Apple, Inc.".to_string()),
                "00-1B-54" => Ok("Cisco Systems, Inc".to_string()),
                _ => Err(ProviderError::NotFound),
            }
        }
    }

    fn processor(
        root: &Path,
    ) -> EnrichmentProcessor<FixedSource, TableService> {
        let lookup = LookupConfig {
            min_interval_ms: 1,
            ..Default::default()
        };
        let output = OutputConfig {
            processed_dir: Some(root.join("processed")),
            failed_dir: Some(root.join("failed")),
            report_dir: Some(root.join("reports")),
        };
        EnrichmentProcessor::new(
            FixedSource(vec![
                "a4:83:e7:01:02:03",
                "A4-83-E7-99-99-99",
                "00:1b:54:aa:bb:cc",
                "02:00:00:00:00:01",
                "garbage",
            ]),
            Arc::new(RateLimitedClient::new(TableService, &lookup)),
            OutputLayout::resolve(&output, root),
        )
    }

    #[tokio::test]
    async fn writes_report_and_moves_capture() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("drive.kismet");
        std::fs::write(&capture, b"data").unwrap();
        let processor = processor(dir.path());

        assert!(!processor.is_processed(&capture).await);
        processor.process(&capture).await.unwrap();

        assert!(!capture.exists());
        assert!(dir.path().join("processed/drive.kismet").exists());
        assert!(processor.is_processed(&capture).await);

        let raw =
            std::fs::read_to_string(dir.path().join("reports/drive.vendors.json"))
                .unwrap();
        let report: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(report["capture"], "drive.kismet");
        assert_eq!(report["summary"]["devices"], 5);
        assert_eq!(report["summary"]["resolved"], 3);
        assert_eq!(report["summary"]["not_found"], 1);
        assert_eq!(report["summary"]["invalid_addresses"], 1);
        assert_eq!(report["devices"][0]["prefix"], "A4-83-E7");
        assert_eq!(report["devices"][0]["status"], "found");
        assert_eq!(report["devices"][0]["detail"], "Apple, Inc.");
    }

    #[tokio::test]
    async fn unreadable_capture_is_moved_to_failed() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("corrupt.kismet");
        std::fs::write(&capture, b"junk").unwrap();
        let processor = processor(dir.path());

        let err = processor.process(&capture).await.unwrap_err();
        assert!(matches!(err, IngestError::Processing { .. }));
        assert!(dir.path().join("failed/corrupt.kismet").exists());
        assert!(!dir.path().join("reports/corrupt.vendors.json").exists());
    }

    #[tokio::test]
    async fn enrichment_runs_as_a_spawned_file_processor() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("spawned.kismet");
        std::fs::write(&capture, b"data").unwrap();
        let processor: Arc<dyn FileProcessor> = Arc::new(processor(dir.path()));

        let task = {
            let capture = capture.clone();
            tokio::spawn(async move { processor.process(&capture).await })
        };
        task.await.unwrap().unwrap();

        assert!(dir.path().join("reports/spawned.vendors.json").exists());
        assert!(dir.path().join("processed/spawned.kismet").exists());
    }
}
