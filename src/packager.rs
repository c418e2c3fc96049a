//! Size-bounded export volumes built from archived records.
//!
//! Attachment bytes are not kept after archiving, so every export fetches
//! them again. Volume 1 carries `manifest.txt` plus as many attachments as
//! fit; later volumes carry attachments only. No volume's uncompressed
//! payload exceeds the configured ceiling.

use crate::db::{BackupConfig, Database, FileBackupRecord, MessageBackupRecord};
use crate::error::{ExportError, FetchError};
use crate::fetch::AttachmentFetcher;
use crate::storage::make_safe_filename;
use bytes::Bytes;
use chrono::Utc;
use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};
use zip::write::FileOptions;

pub const MANIFEST_NAME: &str = "manifest.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// 1-based.
    pub index: usize,
    pub path: PathBuf,
    /// Size of the written archive.
    pub size: u64,
    /// Uncompressed bytes packed into it.
    pub payload: u64,
}

/// Export result. Volumes live in a temporary directory owned by the
/// bundle and are removed when it is dropped.
#[derive(Debug)]
pub struct ExportBundle {
    pub config: BackupConfig,
    pub volumes: Vec<Volume>,
    pub message_count: usize,
    pub attachment_count: usize,
    /// Attachments that could not be fetched again.
    pub skipped: Vec<String>,
    pub total_bytes: u64,
    dir: TempDir,
}

impl ExportBundle {
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Greedy first-fit over `sizes` in order. Volume 0 starts out holding
/// `manifest_len` bytes. Returns attachment indices per volume; a size above
/// `ceiling` yields `Err(index)` before anything is packed.
pub fn plan_volumes(
    manifest_len: u64,
    sizes: &[u64],
    ceiling: u64,
) -> Result<Vec<Vec<usize>>, usize> {
    if let Some(idx) = sizes.iter().position(|&s| s > ceiling) {
        return Err(idx);
    }

    let mut volumes: Vec<Vec<usize>> = vec![Vec::new()];
    let mut used = manifest_len;
    for (idx, &size) in sizes.iter().enumerate() {
        if used + size > ceiling {
            volumes.push(Vec::new());
            used = 0;
        }
        used += size;
        if let Some(current) = volumes.last_mut() {
            current.push(idx);
        }
    }
    Ok(volumes)
}

/// `included[n]` tells whether `files[n]` made it into the export.
fn render_manifest(
    config: &BackupConfig,
    messages: &[MessageBackupRecord],
    files: &[FileBackupRecord],
    included: &[bool],
) -> String {
    let missing = included.iter().filter(|&&ok| !ok).count();
    let mut out = String::new();
    let _ = writeln!(out, "=== Backup ===");
    let _ = writeln!(out, "Title: {}", config.title.as_deref().unwrap_or("(untitled)"));
    let _ = writeln!(out, "Config: {}", config.id);
    let _ = writeln!(out, "Guild: {}", config.location.guild_id);
    let _ = writeln!(out, "Channel: {}", config.location.channel_id);
    if let Some(thread) = config.location.thread_id {
        let _ = writeln!(out, "Thread: {}", thread);
    }
    let _ = writeln!(out, "Author: {}", config.author_id);
    let _ = writeln!(out, "Exported: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "Messages: {}", messages.len());
    let _ = writeln!(out, "Attachments: {}", files.len() - missing);
    if missing > 0 {
        let _ = writeln!(out, "Attachments not retrievable: {}", missing);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "=== Messages ===");
    for (n, message) in messages.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "--- Message {} ---", n + 1);
        let _ = writeln!(out, "ID: {}", message.message_id);
        let _ = writeln!(out, "Sent: {}", message.created_at.format("%Y-%m-%d %H:%M:%S"));
        let content = if message.content.is_empty() {
            "(no text)"
        } else {
            message.content.as_str()
        };
        let _ = writeln!(out, "Content: {}", content);
    }

    if !files.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "=== Attachments ===");
        for (n, file) in files.iter().enumerate() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Attachment {}: {}", n + 1, file.original_filename);
            let _ = writeln!(out, "Size: {} bytes", file.file_size);
            let _ = writeln!(out, "Stored at: {}", file.stored_location);
            if !included.get(n).copied().unwrap_or(false) {
                let _ = writeln!(out, "Status: not included, could not be fetched");
            }
        }
    }
    out
}

pub struct ArchivePackager {
    db: Database,
    fetcher: Arc<dyn AttachmentFetcher>,
    ceiling: u64,
}

impl ArchivePackager {
    pub fn new(db: Database, fetcher: Arc<dyn AttachmentFetcher>, ceiling: u64) -> Self {
        Self {
            db,
            fetcher,
            ceiling,
        }
    }

    pub async fn export(&self, config_id: i64) -> Result<ExportBundle, ExportError> {
        let (config, messages, files) = self
            .db
            .run_blocking(move |db| {
                let config = db.get_config(config_id)?;
                let messages = db.messages_for_config(config_id)?;
                let files = db.files_for_config(config_id)?;
                Ok((config, messages, files))
            })
            .await?;
        let config = config.ok_or(ExportError::ConfigNotFound(config_id))?;

        if let Some(file) = files.iter().find(|f| f.file_size > self.ceiling) {
            return Err(ExportError::AttachmentTooLarge {
                filename: file.original_filename.clone(),
                size: file.file_size,
                limit: self.ceiling,
            });
        }

        let mut payloads: Vec<(String, Bytes)> = Vec::with_capacity(files.len());
        let mut skipped = Vec::new();
        let mut included = vec![false; files.len()];
        for (n, file) in files.iter().enumerate() {
            match self.fetcher.fetch(&file.source_url, self.ceiling).await {
                Ok(bytes) => {
                    let name = format!(
                        "attachments/{:03}_{}",
                        n + 1,
                        make_safe_filename(&file.original_filename)
                    );
                    payloads.push((name, bytes));
                    included[n] = true;
                }
                Err(FetchError::TooLarge { size, limit }) => {
                    return Err(ExportError::AttachmentTooLarge {
                        filename: file.original_filename.clone(),
                        size,
                        limit,
                    });
                }
                Err(e) => {
                    warn!(
                        "Export: skipping '{}' of config {}: {}",
                        file.original_filename, config_id, e
                    );
                    skipped.push(file.original_filename.clone());
                }
            }
        }

        let manifest = render_manifest(&config, &messages, &files, &included);
        if manifest.len() as u64 > self.ceiling {
            return Err(ExportError::ManifestTooLarge {
                size: manifest.len() as u64,
                limit: self.ceiling,
            });
        }

        let sizes: Vec<u64> = payloads.iter().map(|(_, b)| b.len() as u64).collect();
        let plan = plan_volumes(manifest.len() as u64, &sizes, self.ceiling).map_err(|idx| {
            ExportError::AttachmentTooLarge {
                filename: payloads[idx].0.clone(),
                size: sizes[idx],
                limit: self.ceiling,
            }
        })?;

        let dir = tempfile::Builder::new().prefix("archivist-export-").tempdir()?;
        let root = dir.path().to_path_buf();
        let attachment_count = payloads.len();
        let volumes = tokio::task::spawn_blocking(move || {
            write_volumes(&root, config_id, &manifest, &payloads, &plan)
        })
        .await
        .map_err(|e| ExportError::Other(e.into()))??;

        let total_bytes = volumes.iter().map(|v| v.size).sum();
        info!(
            "Export: config {} packed into {} volume(s), {} messages, {} attachments, {} bytes",
            config_id,
            volumes.len(),
            messages.len(),
            attachment_count,
            total_bytes
        );

        Ok(ExportBundle {
            config,
            volumes,
            message_count: messages.len(),
            attachment_count,
            skipped,
            total_bytes,
            dir,
        })
    }
}

fn write_volumes(
    root: &std::path::Path,
    config_id: i64,
    manifest: &str,
    payloads: &[(String, Bytes)],
    plan: &[Vec<usize>],
) -> Result<Vec<Volume>, ExportError> {
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut volumes = Vec::with_capacity(plan.len());

    for (n, members) in plan.iter().enumerate() {
        let index = n + 1;
        let path = root.join(format!("backup_{}_vol{}.zip", config_id, index));
        let file = std::fs::File::create(&path)?;
        let mut zip = zip::ZipWriter::new(file);
        let mut payload = 0u64;

        if index == 1 {
            zip.start_file(MANIFEST_NAME, options)?;
            zip.write_all(manifest.as_bytes())?;
            payload += manifest.len() as u64;
        }
        for &member in members {
            let (name, bytes) = &payloads[member];
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
            payload += bytes.len() as u64;
        }
        zip.finish()?;

        let size = std::fs::metadata(&path)?.len();
        volumes.push(Volume {
            index,
            path,
            size,
            payload,
        });
    }
    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewFileBackup;
    use crate::model::{ContentType, Location};
    use crate::testing::{memory_db, MemoryFetcher};
    use std::io::Read;

    #[test]
    fn test_plan_volumes_greedy_first_fit() {
        // Manifest 10, ceiling 100.
        let plan = plan_volumes(10, &[50, 30, 20, 90, 5], 100).unwrap();
        assert_eq!(plan, vec![vec![0, 1], vec![2], vec![3, 4]]);

        // Exactly at the ceiling still fits.
        assert_eq!(plan_volumes(0, &[60, 40], 100).unwrap(), vec![vec![0, 1]]);

        // Manifest alone when the first attachment would not fit with it.
        assert_eq!(plan_volumes(30, &[80], 100).unwrap(), vec![vec![], vec![0]]);

        assert_eq!(plan_volumes(5, &[], 100).unwrap(), vec![Vec::<usize>::new()]);
        assert_eq!(plan_volumes(0, &[10, 101, 5], 100), Err(1));
    }

    #[test]
    fn test_plan_never_exceeds_ceiling() {
        let sizes: Vec<u64> = (0..40).map(|i| (i * 37 % 97) + 1).collect();
        let manifest = 17;
        let ceiling = 100;
        let plan = plan_volumes(manifest, &sizes, ceiling).unwrap();
        for (n, members) in plan.iter().enumerate() {
            let base = if n == 0 { manifest } else { 0 };
            let total: u64 = base + members.iter().map(|&i| sizes[i]).sum::<u64>();
            assert!(total <= ceiling, "volume {} holds {}", n + 1, total);
        }
        let flattened: Vec<usize> = plan.into_iter().flatten().collect();
        assert_eq!(flattened, (0..sizes.len()).collect::<Vec<_>>());
    }

    fn seed(db: &Database, fetcher: &MemoryFetcher, files: &[(&str, usize)]) -> i64 {
        let config_id = db
            .create_backup_config(&Location::thread(1, 2, 3), 7, Some("Work"))
            .unwrap();
        let backup_id = db
            .insert_message_backup(config_id, 100, "hello", Utc::now(), ContentType::Thread)
            .unwrap()
            .unwrap();
        for (name, size) in files {
            let url = format!("https://cdn.test/{}", name);
            fetcher.insert(&url, vec![b'x'; *size]);
            db.insert_file_backup(&NewFileBackup {
                message_backup_id: backup_id,
                original_filename: name,
                stored_location: name,
                file_size: *size as u64,
                source_url: &url,
            })
            .unwrap();
        }
        config_id
    }

    fn entry_names(path: &std::path::Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_export_splits_volumes_and_cleans_up() {
        let db = memory_db();
        let fetcher = Arc::new(MemoryFetcher::new());
        let config_id = seed(&db, &fetcher, &[("a.png", 1500), ("b.png", 1500), ("c.png", 500)]);

        let packager = ArchivePackager::new(db.clone(), fetcher.clone(), 2048);
        let bundle = packager.export(config_id).await.unwrap();

        assert_eq!(bundle.message_count, 1);
        assert_eq!(bundle.attachment_count, 3);
        assert!(bundle.skipped.is_empty());
        assert_eq!(bundle.volumes.len(), 2);
        for volume in &bundle.volumes {
            assert!(volume.payload <= 2048);
            assert!(volume.path.exists());
        }

        let first = entry_names(&bundle.volumes[0].path);
        assert_eq!(first, vec![MANIFEST_NAME, "attachments/001_a.png"]);
        let second = entry_names(&bundle.volumes[1].path);
        assert_eq!(second, vec!["attachments/002_b.png", "attachments/003_c.png"]);

        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&bundle.volumes[0].path).unwrap()).unwrap();
        let mut manifest = String::new();
        archive
            .by_name(MANIFEST_NAME)
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        assert!(manifest.contains("Title: Work"));
        assert!(manifest.contains("Content: hello"));
        assert!(manifest.contains("Attachment 3: c.png"));

        drop(archive);
        let dir = bundle.dir().to_path_buf();
        drop(bundle);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_export_rejects_oversize_attachment() {
        let db = memory_db();
        let fetcher = Arc::new(MemoryFetcher::new());
        let config_id = seed(&db, &fetcher, &[("ok.png", 10), ("huge.png", 5000)]);

        let packager = ArchivePackager::new(db, fetcher, 2048);
        let err = packager.export(config_id).await.unwrap_err();
        assert!(matches!(
            err,
            ExportError::AttachmentTooLarge { ref filename, size: 5000, limit: 2048 } if filename == "huge.png"
        ));
    }

    #[tokio::test]
    async fn test_export_skips_unfetchable_and_unknown_config() {
        let db = memory_db();
        let fetcher = Arc::new(MemoryFetcher::new());
        let config_id = seed(&db, &fetcher, &[("a.png", 10)]);
        db.insert_file_backup(&NewFileBackup {
            message_backup_id: db.messages_for_config(config_id).unwrap()[0].id,
            original_filename: "gone.png",
            stored_location: "gone.png",
            file_size: 10,
            source_url: "https://cdn.test/missing",
        })
        .unwrap();

        let packager = ArchivePackager::new(db, fetcher, 4096);
        let bundle = packager.export(config_id).await.unwrap();
        assert_eq!(bundle.attachment_count, 1);
        assert_eq!(bundle.skipped, vec!["gone.png".to_string()]);
        assert_eq!(bundle.volumes.len(), 1);

        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&bundle.volumes[0].path).unwrap()).unwrap();
        let mut manifest = String::new();
        archive
            .by_name(MANIFEST_NAME)
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        assert!(manifest.contains("Attachments: 1\n"));
        assert!(manifest.contains("Attachments not retrievable: 1"));
        let gone = manifest.split("Attachment 2: gone.png").nth(1).unwrap();
        assert!(gone.contains("Status: not included"));
        let kept = manifest
            .split("Attachment 1: a.png")
            .nth(1)
            .unwrap()
            .split("Attachment 2")
            .next()
            .unwrap();
        assert!(!kept.contains("Status: not included"));
        drop(archive);

        assert!(matches!(
            packager.export(999).await,
            Err(ExportError::ConfigNotFound(999))
        ));
    }
}
