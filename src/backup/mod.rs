pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod db_list;
pub(crate) mod filter;
mod logic;
pub(crate) mod s3_upload;

pub use logic::EngineReport;

use crate::config::AppConfig;
use crate::errors::Result;
use crate::utils::SystemCommandRunner;
use logic::BackupPipeline;
use s3_upload::S3Uploader;

/// Public entry point for the backup process: runs every selected engine
/// against the real servers, dump tools, and S3.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<Vec<EngineReport>> {
    let runner = SystemCommandRunner;
    let uploader = S3Uploader::connect(&app_config.s3).await;

    BackupPipeline::new(app_config, &runner, &uploader)
        .run(db_list::lister_for)
        .await
}
