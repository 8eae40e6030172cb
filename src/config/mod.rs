// dbbackup/src/config/mod.rs
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::backup::filter::DiscardSet;
use crate::errors::{AppError, Result};

const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_ENGINES: &str = "mysql";
const DEFAULT_S3_ENDPOINT: &str = "https://s3.amazonaws.com";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_ENV_FILE: &str = ".env";

/// Separator used by every list-valued variable (engines, discard list).
pub const LIST_SEPARATOR: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    MySql,
    Postgres,
}

impl Engine {
    /// Accepts the spellings operators have historically used in `BACKUP_ENGINES`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" => Some(Engine::MySql),
            "postgres" | "postgresql" | "postgree" | "pg" => Some(Engine::Postgres),
            _ => None,
        }
    }

    /// Short lowercase name used in run labels.
    pub fn label(&self) -> &'static str {
        match self {
            Engine::MySql => "mysql",
            Engine::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::MySql => write!(f, "MySQL"),
            Engine::Postgres => write!(f, "PostgreSQL"),
        }
    }
}

/// One entry of the engine selection list, kept in the order it was configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSelection {
    Engine(Engine),
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zip" => Some(ArchiveFormat::Zip),
            "tar.gz" | "tgz" => Some(ArchiveFormat::TarGz),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub default_database: Option<String>,
}

impl ConnectionConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub mysqldump: String,
    pub pg_dump: String,
    pub zip: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            mysqldump: "mysqldump".to_string(),
            pg_dump: "pg_dump".to_string(),
            zip: "zip".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: String,
}

impl S3StorageConfig {
    pub fn uses_default_endpoint(&self) -> bool {
        self.endpoint_url == DEFAULT_S3_ENDPOINT
    }

    /// Remote key for an archive file name under the configured prefix.
    pub fn object_key(&self, file_name: &str) -> String {
        let prefix = self.folder_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", prefix, file_name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engines: Vec<EngineSelection>,
    pub mysql: Option<ConnectionConfig>,
    pub postgres: Option<ConnectionConfig>,
    pub backup_dir: PathBuf,
    pub discard: DiscardSet,
    pub archive_format: ArchiveFormat,
    pub tools: ToolPaths,
    pub s3: S3StorageConfig,
}

impl AppConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let engines = parse_engine_selection(&get("BACKUP_ENGINES").unwrap_or_else(|| DEFAULT_ENGINES.to_string()));
        if engines.is_empty() {
            return Err(AppError::Config("BACKUP_ENGINES does not name any engine".to_string()));
        }
        let selected = |engine: Engine| engines.contains(&EngineSelection::Engine(engine));

        let mysql = if selected(Engine::MySql) {
            Some(ConnectionConfig {
                engine: Engine::MySql,
                host: required(&get, "DB_HOST")?,
                port: parse_port(&get, "DB_PORT", 3306)?,
                user: required(&get, "DB_USERNAME")?,
                password: get("DB_PASSWORD").unwrap_or_default(),
                default_database: None,
            })
        } else {
            None
        };

        let postgres = if selected(Engine::Postgres) {
            Some(ConnectionConfig {
                engine: Engine::Postgres,
                host: required(&get, "POSTGREE_DB_HOST")?,
                port: parse_port(&get, "POSTGREE_DB_PORT", 5432)?,
                user: required(&get, "POSTGREE_DB_USERNAME")?,
                password: get("POSTGREE_DB_PASSWORD")
                    .or_else(|| get("DB_PASSWORD"))
                    .unwrap_or_default(),
                default_database: Some(get("POSTGREE_DB_DATABASE").unwrap_or_else(|| "postgres".to_string())),
            })
        } else {
            None
        };

        let archive_format = match get("ARCHIVE_FORMAT") {
            Some(raw) => ArchiveFormat::parse(&raw).ok_or_else(|| {
                AppError::Config(format!("ARCHIVE_FORMAT must be 'zip' or 'tar.gz', got '{}'", raw))
            })?,
            None => ArchiveFormat::Zip,
        };

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            mysqldump: get("MYSQLDUMP_PATH").unwrap_or(defaults.mysqldump),
            pg_dump: get("PG_DUMP_PATH").unwrap_or(defaults.pg_dump),
            zip: get("ZIP_PATH").unwrap_or(defaults.zip),
        };

        let s3 = S3StorageConfig {
            endpoint_url: get("AWS_ENDPOINT").unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string()),
            region: get("AWS_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            access_key_id: required(&get, "AWS_ACCESS_KEY")?,
            secret_access_key: required(&get, "AWS_SECRET_KEY")?,
            bucket_name: required(&get, "AWS_BUCKET")?,
            folder_prefix: get("S3_PATH").unwrap_or_default(),
        };

        Ok(AppConfig {
            engines,
            mysql,
            postgres,
            backup_dir: PathBuf::from(get("BACKUP_DIR").unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string())),
            discard: DiscardSet::parse(&get("LIST_DB_DISCARD").unwrap_or_default()),
            archive_format,
            tools,
            s3,
        })
    }

    pub fn connection(&self, engine: Engine) -> Option<&ConnectionConfig> {
        match engine {
            Engine::MySql => self.mysql.as_ref(),
            Engine::Postgres => self.postgres.as_ref(),
        }
    }

    pub fn dump_tool(&self, engine: Engine) -> &str {
        match engine {
            Engine::MySql => &self.tools.mysqldump,
            Engine::Postgres => &self.tools.pg_dump,
        }
    }
}

/// Loads a dotenv file into the process environment.
///
/// Without an explicit path the default `.env` is optional; an explicit path must exist.
/// Returns the path that was loaded, if any.
pub fn load_env_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            dotenv::from_path(path).map_err(|e| {
                AppError::Config(format!("Failed to load environment file {}: {}", path.display(), e))
            })?;
            Ok(Some(path.to_path_buf()))
        }
        None => {
            let path = PathBuf::from(DEFAULT_ENV_FILE);
            if !path.exists() {
                return Ok(None);
            }
            dotenv::from_path(&path).map_err(|e| {
                AppError::Config(format!("Failed to load environment file {}: {}", path.display(), e))
            })?;
            Ok(Some(path))
        }
    }
}

fn parse_engine_selection(raw: &str) -> Vec<EngineSelection> {
    raw.split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| match Engine::parse(name) {
            Some(engine) => EngineSelection::Engine(engine),
            None => EngineSelection::Unrecognized(name.to_string()),
        })
        .collect()
}

fn required<F>(get: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| AppError::Config(format!("{} must be set", key)))
}

fn parse_port<F>(get: &F, key: &str, default: u16) -> Result<u16>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| AppError::Config(format!("{} must be a port number, got '{}'", key, raw))),
        None => Ok(default),
    }
}
