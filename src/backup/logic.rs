// dbbackup/src/backup/logic.rs
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::backup::archive::Archiver;
use crate::backup::db_dump::DumpRunner;
use crate::backup::db_list::DatabaseLister;
use crate::backup::filter::filter_databases;
use crate::backup::s3_upload::{Uploader, upload_file};
use crate::config::{AppConfig, ConnectionConfig, Engine, EngineSelection};
use crate::errors::{AppError, IoContext, Result};
use crate::utils::lock::RunLock;
use crate::utils::{CommandRunner, run_timestamp};

/// Progress of one engine pipeline. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    Init,
    Listed,
    Filtered,
    Dumped,
    Archived,
    Uploaded,
    UploadFailed,
    Cleaned,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one engine pipeline.
#[derive(Debug)]
pub struct EngineReport {
    pub engine: Engine,
    pub dumped: Vec<String>,
    pub skipped: Vec<String>,
    pub archive: PathBuf,
    pub remote_key: String,
    pub stage: BackupStage,
}

impl EngineReport {
    /// The archive is still on disk and must be uploaded by hand.
    pub fn archive_retained(&self) -> bool {
        self.stage == BackupStage::UploadFailed
    }
}

struct StageTracker {
    engine: Engine,
    stage: BackupStage,
}

impl StageTracker {
    fn new(engine: Engine) -> Self {
        StageTracker { engine, stage: BackupStage::Init }
    }

    fn enter(&mut self, next: BackupStage) {
        debug!("{} pipeline: {} -> {}", self.engine, self.stage, next);
        self.stage = next;
    }
}

/// Sequences list → filter → dump → archive → upload → cleanup for every selected engine.
pub struct BackupPipeline<'a> {
    config: &'a AppConfig,
    runner: &'a dyn CommandRunner,
    uploader: &'a dyn Uploader,
}

impl<'a> BackupPipeline<'a> {
    pub fn new(config: &'a AppConfig, runner: &'a dyn CommandRunner, uploader: &'a dyn Uploader) -> Self {
        BackupPipeline { config, runner, uploader }
    }

    /// Runs each selected engine in configuration order.
    ///
    /// Unrecognized engines are skipped. A failed upload ends that engine in
    /// `UploadFailed` and the run continues; any other error aborts.
    pub async fn run<F>(&self, lister_for: F) -> Result<Vec<EngineReport>>
    where
        F: Fn(&ConnectionConfig) -> Box<dyn DatabaseLister>,
    {
        let backup_root = prepare_backup_root(&self.config.backup_dir)?;
        let lock = RunLock::acquire(&backup_root)?;
        debug!("Holding run lock {}", lock.path().display());

        let mut reports = Vec::new();
        let mut seen = HashSet::new();
        for selection in &self.config.engines {
            let engine = match selection {
                EngineSelection::Engine(engine) => *engine,
                EngineSelection::Unrecognized(name) => {
                    warn!("❌ Unrecognized engine '{}' in BACKUP_ENGINES, skipping", name);
                    continue;
                }
            };
            if !seen.insert(engine) {
                warn!("{} is listed more than once in BACKUP_ENGINES, running it once", engine);
                continue;
            }
            let conn = self.config.connection(engine).ok_or_else(|| {
                AppError::Config(format!("{} is selected but has no connection settings", engine))
            })?;

            info!("🚀 Starting {} backup", engine);
            let lister = lister_for(conn);
            let report = self.run_engine(&backup_root, conn, lister.as_ref()).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_engine(
        &self,
        backup_root: &Path,
        conn: &ConnectionConfig,
        lister: &dyn DatabaseLister,
    ) -> Result<EngineReport> {
        let engine = conn.engine;
        let mut tracker = StageTracker::new(engine);

        let databases = lister.list_databases().await?;
        info!("Found {} databases on {}", databases.len(), conn.address());
        tracker.enter(BackupStage::Listed);

        let (selected, skipped) = filter_databases(&databases, &self.config.discard);
        for name in &skipped {
            info!("⏭ Skipping database: {} because it's in the list of discarded databases", name);
        }
        tracker.enter(BackupStage::Filtered);

        let dumper = DumpRunner::new(self.runner, conn, self.config.dump_tool(engine))?;
        let label = format!("{}_{}", run_timestamp(), engine.label());
        let run_dir = backup_root.join(&label);
        fs::create_dir_all(&run_dir)
            .fs_context(|| format!("Failed to create backup directory {}", run_dir.display()))?;
        info!("📂 Backup directory created at: {}", run_dir.display());

        dumper.dump_all(&selected, &run_dir)?;
        tracker.enter(BackupStage::Dumped);

        let archive = Archiver::new(self.runner, self.config.archive_format, &self.config.tools.zip)
            .archive_run(&run_dir)?;
        tracker.enter(BackupStage::Archived);

        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.clone());
        let remote_key = self.config.s3.object_key(&file_name);

        match upload_file(self.uploader, &archive, &remote_key).await {
            Ok(()) => {
                tracker.enter(BackupStage::Uploaded);
                info!("Removing backup archive {}", archive.display());
                if let Err(e) = fs::remove_file(&archive) {
                    warn!("⚠️ Failed to remove uploaded archive {}: {}", archive.display(), e);
                }
                tracker.enter(BackupStage::Cleaned);
            }
            Err(e) if e.is_recoverable() => {
                error!("❌ Failed to upload backup: {}", e);
                warn!("Archive kept for manual upload at {}", archive.display());
                tracker.enter(BackupStage::UploadFailed);
            }
            Err(e) => return Err(e),
        }

        info!("🎉 {} backup completed", engine);
        Ok(EngineReport {
            engine,
            dumped: selected,
            skipped,
            archive,
            remote_key,
            stage: tracker.stage,
        })
    }
}

/// Creates the backup root if needed and returns its absolute path.
fn prepare_backup_root(backup_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)
        .fs_context(|| format!("Failed to create backup root directory {}", backup_dir.display()))?;
    fs::canonicalize(backup_dir)
        .fs_context(|| format!("Failed to resolve backup root directory {}", backup_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::db_list::tests::StaticLister;
    use crate::backup::s3_upload::tests::MemoryUploader;
    use crate::config::tests::lookup_from;
    use crate::utils::lock::LOCK_FILE_NAME;
    use crate::utils::tests::{FakeRunner, exited};
    use flate2::read::GzDecoder;
    use std::ffi::OsString;
    use tempfile::{TempDir, tempdir};

    fn config(root: &TempDir, engines: &str, discard: &str) -> AppConfig {
        let backup_dir = root.path().join("backups").to_string_lossy().into_owned();
        let vars = [
            ("BACKUP_ENGINES", engines),
            ("BACKUP_DIR", backup_dir.as_str()),
            ("LIST_DB_DISCARD", discard),
            ("ARCHIVE_FORMAT", "tar.gz"),
            ("S3_PATH", "nightly"),
            ("DB_HOST", "mysql.internal"),
            ("DB_USERNAME", "root"),
            ("DB_PASSWORD", "pw"),
            ("POSTGREE_DB_HOST", "pg.internal"),
            ("POSTGREE_DB_USERNAME", "postgres"),
            ("AWS_BUCKET", "backups"),
            ("AWS_ACCESS_KEY", "AKIAEXAMPLE"),
            ("AWS_SECRET_KEY", "secret"),
        ];
        AppConfig::from_lookup(lookup_from(&vars)).unwrap()
    }

    /// Dump tool double: writes `-- <db>` to the output file, fails for `fail_on`.
    fn dump_runner(fail_on: Option<&'static str>) -> FakeRunner {
        FakeRunner::new(move |spec| {
            let db = spec.target_database().unwrap();
            if Some(db.as_str()) == fail_on {
                return exited(1);
            }
            let out = spec
                .arg_value("--result-file")
                .or_else(|| spec.arg_value("--file"))
                .unwrap();
            fs::write(out, format!("-- {}\n", db)).unwrap();
            exited(0)
        })
    }

    fn dumped_names(runner: &FakeRunner) -> Vec<String> {
        runner
            .calls()
            .iter()
            .map(|c| c.target_database().unwrap())
            .collect()
    }

    fn archive_entries(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.header().entry_type().is_file())
            .map(|e| {
                e.path()
                    .unwrap()
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        names.sort();
        names
    }

    fn mysql_server() -> impl Fn(&ConnectionConfig) -> Box<dyn DatabaseLister> {
        |conn: &ConnectionConfig| -> Box<dyn DatabaseLister> {
            match conn.engine {
                Engine::MySql => Box::new(StaticLister::new(Engine::MySql, &["app", "tmp_cache", "analytics"])),
                Engine::Postgres => Box::new(StaticLister::new(Engine::Postgres, &["orders", "postgres"])),
            }
        }
    }

    #[tokio::test]
    async fn test_discarded_database_is_not_dumped_and_archive_is_cleaned() {
        let root = tempdir().unwrap();
        let config = config(&root, "mysql", "tmp_cache");
        let runner = dump_runner(None);
        let uploader = MemoryUploader::new();

        let reports = BackupPipeline::new(&config, &runner, &uploader)
            .run(mysql_server())
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.stage, BackupStage::Cleaned);
        assert_eq!(report.dumped, vec!["app", "analytics"]);
        assert_eq!(report.skipped, vec!["tmp_cache"]);
        assert_eq!(dumped_names(&runner), vec!["app", "analytics"]);
        assert!(!report.archive.exists());
        assert!(!report.archive_retained());

        let objects = uploader.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].0.starts_with("nightly/"));
        assert!(objects[0].0.ends_with("_mysql.tar.gz"));
        assert_eq!(archive_entries(&objects[0].1), vec!["analytics.sql", "app.sql"]);

        // only the (now empty) backup root is left, lock released
        let leftovers: Vec<OsString> = fs::read_dir(root.path().join("backups"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_archive() {
        let root = tempdir().unwrap();
        let config = config(&root, "mysql", "");
        let runner = dump_runner(None);
        let uploader = MemoryUploader::failing();

        let reports = BackupPipeline::new(&config, &runner, &uploader)
            .run(mysql_server())
            .await
            .unwrap();

        let report = &reports[0];
        assert_eq!(report.stage, BackupStage::UploadFailed);
        assert!(report.archive_retained());
        assert!(report.archive.is_file());
        let bytes = fs::read(&report.archive).unwrap();
        assert_eq!(archive_entries(&bytes), vec!["analytics.sql", "app.sql", "tmp_cache.sql"]);
        assert!(!root.path().join("backups").join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_both_engines_run_independently() {
        let root = tempdir().unwrap();
        let config = config(&root, "postgree;mysql", "postgres");
        let runner = dump_runner(None);
        let uploader = MemoryUploader::new();

        let reports = BackupPipeline::new(&config, &runner, &uploader)
            .run(mysql_server())
            .await
            .unwrap();

        let engines: Vec<Engine> = reports.iter().map(|r| r.engine).collect();
        assert_eq!(engines, vec![Engine::Postgres, Engine::MySql]);
        assert!(reports.iter().all(|r| r.stage == BackupStage::Cleaned));
        assert_eq!(reports[0].dumped, vec!["orders"]);

        let keys = uploader.keys();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with("_postgres.tar.gz"));
        assert!(keys[1].ends_with("_mysql.tar.gz"));
        assert_eq!(dumped_names(&runner), vec!["orders", "app", "tmp_cache", "analytics"]);
    }

    #[tokio::test]
    async fn test_unrecognized_engine_is_skipped() {
        let root = tempdir().unwrap();
        let config = config(&root, "oracle;mysql;mysql", "");
        let runner = dump_runner(None);
        let uploader = MemoryUploader::new();

        let reports = BackupPipeline::new(&config, &runner, &uploader)
            .run(mysql_server())
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].engine, Engine::MySql);
        assert_eq!(uploader.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_dump_failure_aborts_before_upload() {
        let root = tempdir().unwrap();
        let config = config(&root, "mysql;postgres", "");
        let runner = dump_runner(Some("tmp_cache"));
        let uploader = MemoryUploader::new();

        let err = BackupPipeline::new(&config, &runner, &uploader)
            .run(mysql_server())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Command { .. }));
        assert_eq!(dumped_names(&runner), vec!["app", "tmp_cache"]);
        assert!(uploader.keys().is_empty());

        // the run directory with the partial dump stays behind; no archive, no lock
        let backups = root.path().join("backups");
        let entries: Vec<PathBuf> = fs::read_dir(&backups).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir());
        assert!(entries[0].join("app.sql").is_file());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_before_creating_run_directory() {
        let root = tempdir().unwrap();
        let config = config(&root, "mysql", "");
        let runner = dump_runner(None);
        let uploader = MemoryUploader::new();

        let err = BackupPipeline::new(&config, &runner, &uploader)
            .run(|_conn: &ConnectionConfig| -> Box<dyn DatabaseLister> {
                Box::new(StaticLister::unreachable(Engine::MySql))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Connection { .. }));
        assert!(runner.calls().is_empty());
        assert_eq!(fs::read_dir(root.path().join("backups")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let root = tempdir().unwrap();
        let config = config(&root, "mysql", "");
        let backups = root.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let _held = RunLock::acquire(&backups).unwrap();

        let runner = dump_runner(None);
        let uploader = MemoryUploader::new();
        let err = BackupPipeline::new(&config, &runner, &uploader)
            .run(mysql_server())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Locked(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_server_still_produces_an_archive() {
        let root = tempdir().unwrap();
        let config = config(&root, "mysql", "");
        let runner = dump_runner(None);
        let uploader = MemoryUploader::failing();

        let reports = BackupPipeline::new(&config, &runner, &uploader)
            .run(|_conn: &ConnectionConfig| -> Box<dyn DatabaseLister> {
                Box::new(StaticLister::new(Engine::MySql, &[]))
            })
            .await
            .unwrap();

        assert!(reports[0].dumped.is_empty());
        assert!(reports[0].archive.is_file());
        assert!(runner.calls().is_empty());
    }
}
