/*!
Scan record persistence.

The orchestrator only needs two writes: one scan record, then one image
record per captured frame. The two calls fail independently; a failed image
write never rolls back the scan record.
*/

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use shared::ScanMetadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Repository for scan and image records
#[async_trait]
pub trait ScanRepository: Send + Sync {
    /// Create the scan record and return its identifier
    async fn create_scan(
        &self,
        metadata: &ScanMetadata,
        frame_count: u32,
        output_path: &Path,
    ) -> Result<String>;

    /// Create one image record per frame path, in frame order
    async fn create_images(&self, scan_id: &str, frame_paths: &[PathBuf]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: String,
    pub metadata: ScanMetadata,
    pub frame_count: u32,
    pub output_path: PathBuf,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub scan_id: String,
    /// 1-based, matching the file name
    pub frame_number: u32,
    pub path: PathBuf,
}

/// One line of a records file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Scan(ScanRecord),
    Image(ImageRecord),
}

fn image_records(scan_id: &str, frame_paths: &[PathBuf]) -> Vec<ImageRecord> {
    frame_paths
        .iter()
        .zip(1..)
        .map(|(path, frame_number)| ImageRecord {
            scan_id: scan_id.to_string(),
            frame_number,
            path: path.clone(),
        })
        .collect()
}

fn scan_record(scan_id: String, metadata: &ScanMetadata, frame_count: u32, output_path: &Path) -> ScanRecord {
    ScanRecord {
        scan_id,
        metadata: metadata.clone(),
        frame_count,
        output_path: output_path.to_path_buf(),
        created_at: Local::now().to_rfc3339(),
    }
}

#[derive(Default)]
struct Tables {
    scans: Vec<ScanRecord>,
    images: Vec<ImageRecord>,
}

/// Keeps records in memory; failures can be switched on for testing
#[derive(Default)]
pub struct InMemoryScanRepository {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    fail_create_scan: bool,
    fail_create_images: bool,
}

impl InMemoryScanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_scan` fail
    pub fn failing_scans(mut self) -> Self {
        self.fail_create_scan = true;
        self
    }

    /// Make `create_images` fail
    pub fn failing_images(mut self) -> Self {
        self.fail_create_images = true;
        self
    }

    pub fn scans(&self) -> Vec<ScanRecord> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner).scans.clone()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner).images.clone()
    }
}

#[async_trait]
impl ScanRepository for InMemoryScanRepository {
    async fn create_scan(
        &self,
        metadata: &ScanMetadata,
        frame_count: u32,
        output_path: &Path,
    ) -> Result<String> {
        if self.fail_create_scan {
            bail!("scan table is unavailable");
        }
        let scan_id = format!("scan-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = scan_record(scan_id.clone(), metadata, frame_count, output_path);
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .scans
            .push(record);
        Ok(scan_id)
    }

    async fn create_images(&self, scan_id: &str, frame_paths: &[PathBuf]) -> Result<()> {
        if self.fail_create_images {
            bail!("image table is unavailable");
        }
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if !tables.scans.iter().any(|scan| scan.scan_id == scan_id) {
            bail!("unknown scan id {}", scan_id);
        }
        tables.images.extend(image_records(scan_id, frame_paths));
        Ok(())
    }
}

/// Appends records as JSON lines to a file
pub struct JsonlScanRepository {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    sequence: AtomicU64,
}

impl JsonlScanRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, records: &[Record]) -> Result<()> {
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open records file {}", self.path.display()))?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        debug!("Appended {} record(s) to {}", records.len(), self.path.display());
        Ok(())
    }

    /// Read every record back, in file order
    pub async fn load(&self) -> Result<Vec<Record>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read records file {}", self.path.display()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Malformed record line"))
            .collect()
    }
}

#[async_trait]
impl ScanRepository for JsonlScanRepository {
    async fn create_scan(
        &self,
        metadata: &ScanMetadata,
        frame_count: u32,
        output_path: &Path,
    ) -> Result<String> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let scan_id = format!(
            "{}_{}_{}",
            metadata.plant_id,
            Local::now().format("%Y%m%d%H%M%S"),
            sequence
        );
        let record = scan_record(scan_id.clone(), metadata, frame_count, output_path);
        self.append(&[Record::Scan(record)]).await?;
        Ok(scan_id)
    }

    async fn create_images(&self, scan_id: &str, frame_paths: &[PathBuf]) -> Result<()> {
        let records: Vec<Record> = image_records(scan_id, frame_paths)
            .into_iter()
            .map(Record::Image)
            .collect();
        self.append(&records).await
    }
}
