// dbbackup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::ArchiveFormat;
use crate::errors::{AppError, Result};
use crate::utils::{CommandRunner, CommandSpec, run_checked};

/// Turns a run directory into a single archive next to it.
pub struct Archiver<'a> {
    runner: &'a dyn CommandRunner,
    format: ArchiveFormat,
    zip_tool: &'a str,
}

impl<'a> Archiver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, format: ArchiveFormat, zip_tool: &'a str) -> Self {
        Archiver { runner, format, zip_tool }
    }

    /// Archives `run_dir` into `<parent>/<run-label>.<ext>` and removes `run_dir`.
    ///
    /// Entries are stored as `<run-label>/<file>`. The archive is written to a
    /// `.part` file first and renamed into place once complete. If archiving
    /// fails the run directory is left untouched.
    pub fn archive_run(&self, run_dir: &Path) -> Result<PathBuf> {
        let run_dir = fs::canonicalize(run_dir).map_err(|e| {
            AppError::Archive(format!("Run directory {} is not accessible: {}", run_dir.display(), e))
        })?;
        if !run_dir.is_dir() {
            return Err(AppError::Archive(format!(
                "Source for archival is not a directory: {}",
                run_dir.display()
            )));
        }
        let (backup_root, label) = match (run_dir.parent(), run_dir.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => {
                return Err(AppError::Archive(format!(
                    "Run directory {} has no parent directory",
                    run_dir.display()
                )));
            }
        };

        let archive_name = format!("{}.{}", label, self.format.extension());
        let archive_path = backup_root.join(&archive_name);
        let partial_path = backup_root.join(format!("{}.part", archive_name));
        if partial_path.exists() {
            let _ = fs::remove_file(&partial_path);
        }

        info!("🗜 Compressing {} into {}", run_dir.display(), archive_path.display());
        let built = match self.format {
            ArchiveFormat::Zip => self.build_zip(&backup_root, &label, &partial_path),
            ArchiveFormat::TarGz => create_tar_gz_archive(&run_dir, &label, &partial_path),
        };
        if let Err(e) = built {
            if partial_path.exists() {
                let _ = fs::remove_file(&partial_path);
            }
            return Err(e);
        }

        fs::rename(&partial_path, &archive_path).map_err(|e| {
            AppError::Archive(format!(
                "Failed to move {} to {}: {}",
                partial_path.display(),
                archive_path.display(),
                e
            ))
        })?;
        info!("✅ Backup folder archived to: {}", archive_path.display());

        info!("Removing backup folder {}", run_dir.display());
        if let Err(e) = fs::remove_dir_all(&run_dir) {
            warn!("⚠️ Failed to remove backup folder {}: {}", run_dir.display(), e);
        }

        Ok(archive_path)
    }

    fn build_zip(&self, backup_root: &Path, label: &str, partial_path: &Path) -> Result<()> {
        let zip = self
            .runner
            .locate(self.zip_tool)
            .map_err(|e| AppError::Archive(e.to_string()))?;
        let spec = CommandSpec::new(zip)
            .arg("-r")
            .arg("-q")
            .arg(partial_path)
            .arg(label)
            .current_dir(backup_root);
        run_checked(self.runner, &spec).map_err(|e| AppError::Archive(e.to_string()))?;
        if !partial_path.is_file() {
            return Err(AppError::Archive(format!(
                "zip reported success but {} was not created",
                partial_path.display()
            )));
        }
        Ok(())
    }
}

/// Writes a gzipped tar of `source_dir` to `archive_dest_path`, entries rooted at `root_name`.
fn create_tar_gz_archive(source_dir: &Path, root_name: &str, archive_dest_path: &Path) -> Result<()> {
    let archive_err = |what: String, e: &dyn std::fmt::Display| AppError::Archive(format!("{}: {}", what, e));

    let archive_file = File::create(archive_dest_path)
        .map_err(|e| archive_err(format!("Failed to create archive file {}", archive_dest_path.display()), &e))?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| archive_err(format!("Failed to walk directory {}", source_dir.display()), &e))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source_dir)
            .map_err(|e| archive_err(format!("Failed to strip prefix from {}", path.display()), &e))?;
        let name = Path::new(root_name).join(relative);

        if entry.file_type().is_dir() {
            tar_builder
                .append_dir(&name, path)
                .map_err(|e| archive_err(format!("Failed to append directory {}", path.display()), &e))?;
        } else if entry.file_type().is_file() {
            tar_builder
                .append_path_with_name(path, &name)
                .map_err(|e| archive_err(format!("Failed to append file {}", path.display()), &e))?;
        }
    }

    let encoder = tar_builder
        .into_inner()
        .map_err(|e| archive_err(format!("Failed to finish tar stream for {}", archive_dest_path.display()), &e))?;
    encoder
        .finish()
        .map_err(|e| archive_err(format!("Failed to finish gzip encoding for {}", archive_dest_path.display()), &e))?;
    Ok(())
}
