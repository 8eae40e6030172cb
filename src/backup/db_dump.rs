// dbbackup/src/backup/db_dump.rs
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::config::{ConnectionConfig, Engine};
use crate::errors::{AppError, Result};
use crate::utils::{CommandRunner, CommandSpec, run_checked};

/// Dumps databases one at a time with the engine's dump tool.
pub struct DumpRunner<'a> {
    runner: &'a dyn CommandRunner,
    conn: &'a ConnectionConfig,
    tool: PathBuf,
}

impl<'a> DumpRunner<'a> {
    /// Resolves the dump tool up front so a missing binary fails before any directory is created.
    pub fn new(runner: &'a dyn CommandRunner, conn: &'a ConnectionConfig, tool: &str) -> Result<Self> {
        let tool = runner.locate(tool)?;
        info!("Found {} dump tool at: {}", conn.engine, tool.display());
        Ok(DumpRunner { runner, conn, tool })
    }

    /// Dumps every database into `run_dir/<name>.sql`, stopping at the first failure.
    pub fn dump_all(&self, databases: &[String], run_dir: &Path) -> Result<Vec<PathBuf>> {
        for db_name in databases {
            validate_database_name(db_name)?;
        }

        let mut dumps = Vec::with_capacity(databases.len());
        for db_name in databases {
            let out = dump_path(run_dir, db_name);
            info!("💾 Backing up database: {}", db_name);
            run_checked(self.runner, &self.command_for(db_name, &out))?;
            info!("✓ {} dumped to {}", db_name, out.display());
            dumps.push(out);
        }
        Ok(dumps)
    }

    fn command_for(&self, db_name: &str, out: &Path) -> CommandSpec {
        let conn = self.conn;
        match conn.engine {
            Engine::MySql => CommandSpec::new(&self.tool)
                .arg("--host")
                .arg(&conn.host)
                .arg("--port")
                .arg(conn.port.to_string())
                .arg("--user")
                .arg(&conn.user)
                .arg("--lock-tables=false")
                .arg(format!("--result-file={}", out.display()))
                .arg("--")
                .arg(db_name)
                .env("MYSQL_PWD", &conn.password),
            Engine::Postgres => CommandSpec::new(&self.tool)
                .arg("--host")
                .arg(&conn.host)
                .arg("--port")
                .arg(conn.port.to_string())
                .arg("--username")
                .arg(&conn.user)
                .arg("--no-password")
                .arg("--format=plain")
                .arg("--file")
                .arg(out)
                .arg(format!("--dbname={}", pg_conninfo_dbname(db_name)))
                .env("PGPASSWORD", &conn.password),
        }
    }
}

/// Quotes `db_name` as a libpq `dbname='...'` keyword so names holding `=`
/// or a leading `-` reach the server unchanged.
fn pg_conninfo_dbname(db_name: &str) -> String {
    let mut conninfo = String::with_capacity(db_name.len() + 9);
    conninfo.push_str("dbname='");
    for c in db_name.chars() {
        if c == '\\' || c == '\'' {
            conninfo.push('\\');
        }
        conninfo.push(c);
    }
    conninfo.push('\'');
    conninfo
}

pub fn dump_path(run_dir: &Path, db_name: &str) -> PathBuf {
    run_dir.join(format!("{}.sql", db_name))
}

/// Rejects names that would place the dump file outside the run directory.
fn validate_database_name(db_name: &str) -> Result<()> {
    let mut components = Path::new(db_name).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if db_name.is_empty() || !single_normal || db_name.contains(['/', '\\']) {
        return Err(AppError::InvalidInput(format!(
            "refusing to dump database with unsafe name '{}'",
            db_name
        )));
    }
    Ok(())
}
