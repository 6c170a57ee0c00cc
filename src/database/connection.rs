use log::{error, info, warn};
use openssl::ssl::{SslConnector, SslMethod};
use postgres_openssl::MakeTlsConnector;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use url::Url;

const MAX_RETRIES: usize = 5;
const WAIT_BETWEEN_RETRIES: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Invalid database configuration: {0}")]
    Config(String),

    #[error("Statement rejected by server: {0}")]
    Rejected(#[source] tokio_postgres::Error),

    #[error("Giving up after {0} attempts")]
    RetriesExhausted(usize),
}

/// Build a TLS connector that verifies the server against the given CA file
pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, String> {
    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|e| format!("SSL builder error: {}", e))?;

    builder
        .set_ca_file(sslrootcert_path)
        .map_err(|e| format!("Error loading CA cert '{}': {}", sslrootcert_path, e))?;

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Split the `sslrootcert` parameter out of a connection URL
///
/// tokio-postgres rejects the parameter, so it is removed from the query string and
/// returned separately together with the cleaned URL.
pub fn split_sslrootcert(database_url: &str) -> Result<(String, String), String> {
    let mut url = Url::parse(database_url).map_err(|e| format!("URL parse error: {}", e))?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.into_owned());
        } else {
            clean_params.push(format!("{}={}", key, value));
        }
    }

    let sslrootcert_path = sslrootcert_path.ok_or("sslrootcert parameter missing")?;

    if clean_params.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&clean_params.join("&")));
    }

    Ok((url.to_string(), sslrootcert_path))
}

/// One lazily opened database connection shared by every writer
///
/// Callers queue on the mutex, so a burst of readings never opens more than a
/// single connection. A closed connection is reopened on the next statement.
pub struct SharedConnection {
    database_url: String,
    connector: MakeTlsConnector,
    client: Mutex<Option<Client>>,
}

impl SharedConnection {
    /// Validate the URL and CA file; no connection is made until the first statement
    pub fn new(database_url: &str) -> Result<Self, DatabaseError> {
        let (database_url, sslrootcert_path) =
            split_sslrootcert(database_url).map_err(DatabaseError::Config)?;
        let connector = create_ssl_connector(&sslrootcert_path).map_err(DatabaseError::Config)?;

        Ok(SharedConnection {
            database_url,
            connector,
            client: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) =
            tokio_postgres::connect(&self.database_url, self.connector.clone()).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });
        info!("Opened database connection");
        Ok(client)
    }

    /// Run a single statement, reconnecting on connection failures
    ///
    /// Statements the server rejects are returned immediately; connection errors
    /// are retried a bounded number of times.
    pub async fn execute(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DatabaseError> {
        let mut slot = self.client.lock().await;

        for attempt in 1..=MAX_RETRIES {
            if slot.as_ref().map_or(true, Client::is_closed) {
                *slot = None;
                match self.connect().await {
                    Ok(client) => *slot = Some(client),
                    Err(e) => warn!("Attempt {}: connection error: {}", attempt, e),
                }
            }

            if let Some(client) = slot.as_ref() {
                match client.execute(statement, params).await {
                    Ok(rows) => return Ok(rows),
                    Err(e) if e.as_db_error().is_some() => return Err(DatabaseError::Rejected(e)),
                    Err(e) => warn!("Attempt {}: query error: {}", attempt, e),
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(WAIT_BETWEEN_RETRIES).await;
            }
        }

        Err(DatabaseError::RetriesExhausted(MAX_RETRIES))
    }
}
