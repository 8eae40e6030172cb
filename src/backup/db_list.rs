// dbbackup/src/backup/db_list.rs
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use tracing::{debug, info};

use crate::config::{ConnectionConfig, Engine};
use crate::errors::{AppError, Result};

const MYSQL_LIST_QUERY: &str = "SHOW DATABASES";
const POSTGRES_LIST_QUERY: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true";

/// SQLSTATE codes servers use for rejected credentials.
const AUTH_FAILURE_CODES: &[&str] = &["28000", "28P01"];

/// Lists the databases visible to a credential, in server order.
#[async_trait]
pub trait DatabaseLister: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;
}

pub struct MySqlLister {
    conn: ConnectionConfig,
}

pub struct PostgresLister {
    conn: ConnectionConfig,
}

/// Picks the lister implementation for the descriptor's engine.
pub fn lister_for(conn: &ConnectionConfig) -> Box<dyn DatabaseLister> {
    match conn.engine {
        Engine::MySql => Box::new(MySqlLister { conn: conn.clone() }),
        Engine::Postgres => Box::new(PostgresLister { conn: conn.clone() }),
    }
}

#[async_trait]
impl DatabaseLister for MySqlLister {
    async fn list_databases(&self) -> Result<Vec<String>> {
        info!("Fetching list of databases from MySQL at {}...", self.conn.address());
        let mut options = MySqlConnectOptions::new()
            .host(&self.conn.host)
            .port(self.conn.port)
            .username(&self.conn.user)
            .password(&self.conn.password);
        if let Some(db) = &self.conn.default_database {
            options = options.database(db);
        }

        let mut connection = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| classify_connect_error(&self.conn, e))?;

        let rows = sqlx::query(MYSQL_LIST_QUERY)
            .fetch_all(&mut connection)
            .await
            .map_err(|source| AppError::Query { engine: Engine::MySql, source })?;

        // Binary-collated servers return the column as VARBINARY.
        let db_names = rows
            .iter()
            .map(|row| match row.try_get::<String, _>(0) {
                Ok(name) => Ok(name),
                Err(_) => row
                    .try_get::<Vec<u8>, _>(0)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            })
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|source| AppError::Query { engine: Engine::MySql, source })?;

        close_quietly(connection.close().await);
        debug!("Found databases: {:?}", db_names);
        Ok(db_names)
    }
}

#[async_trait]
impl DatabaseLister for PostgresLister {
    async fn list_databases(&self) -> Result<Vec<String>> {
        info!("Fetching list of databases from PostgreSQL at {}...", self.conn.address());
        let mut options = PgConnectOptions::new()
            .host(&self.conn.host)
            .port(self.conn.port)
            .username(&self.conn.user)
            .password(&self.conn.password);
        if let Some(db) = &self.conn.default_database {
            options = options.database(db);
        }

        let mut connection = PgConnection::connect_with(&options)
            .await
            .map_err(|e| classify_connect_error(&self.conn, e))?;

        let rows = sqlx::query(POSTGRES_LIST_QUERY)
            .fetch_all(&mut connection)
            .await
            .map_err(|source| AppError::Query { engine: Engine::Postgres, source })?;

        let db_names: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("datname"))
            .collect::<std::result::Result<_, _>>()
            .map_err(|source| AppError::Query { engine: Engine::Postgres, source })?;

        close_quietly(connection.close().await);
        debug!("Found databases: {:?}", db_names);
        Ok(db_names)
    }
}

fn close_quietly(result: std::result::Result<(), sqlx::Error>) {
    if let Err(e) = result {
        debug!("Ignoring error while closing listing connection: {}", e);
    }
}

fn is_auth_failure_code(code: &str) -> bool {
    AUTH_FAILURE_CODES.contains(&code)
}

/// Maps a failure while establishing the listing connection to `Auth` or `Connection`.
fn classify_connect_error(conn: &ConnectionConfig, source: sqlx::Error) -> AppError {
    let rejected = match &source {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| is_auth_failure_code(&code)),
        _ => false,
    };
    if rejected {
        AppError::Auth {
            engine: conn.engine,
            user: conn.user.clone(),
            source,
        }
    } else {
        AppError::Connection {
            engine: conn.engine,
            address: conn.address(),
            source,
        }
    }
}
