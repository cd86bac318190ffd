//! Minimal ClickHouse HTTP interface client.
//!
//! Queries are POSTed as the request body. Credentials travel in the
//! `X-ClickHouse-User` / `X-ClickHouse-Key` headers, never in the URL, and the
//! password is scrubbed from every error message.

use crate::db::tls::TlsMaterial;
use crate::db::types::{ConnectionConfig, EngineType};
use crate::error::{Result, SchemaflowError};
use reqwest::{Certificate, Client, Identity, StatusCode, Url};
use crate::constants::SESSION_ID_PREFIX;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

const ENGINE: EngineType = EngineType::ClickHouse;

#[derive(Clone)]
pub(super) struct ClickHouseClient {
    http: Client,
    url: Url,
    username: String,
    password: String,
    target: String,
}

impl std::fmt::Debug for ClickHouseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseClient")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .finish()
    }
}

/// Query scope: default database and optional server-side session
#[derive(Debug, Clone, Default)]
pub(super) struct Scope<'a> {
    pub database: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub fn in_session(mut self, session_id: &'a str) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

pub(super) fn new_session_id() -> String {
    format!("{SESSION_ID_PREFIX}-{}", Uuid::new_v4())
}

impl ClickHouseClient {
    pub fn new(
        config: &ConnectionConfig,
        tls: Option<TlsMaterial>,
        timeout: Duration,
    ) -> Result<Self> {
        let port = config.port_or_default(ENGINE);
        let target = format!("{}:{port}", config.host);
        let scheme = if tls.is_some() { "https" } else { "http" };
        let url = Url::parse(&format!("{scheme}://{target}/")).map_err(|e| {
            SchemaflowError::connection(ENGINE, &target, format!("Invalid host: {e}"))
        })?;

        let fail = |reason: String| SchemaflowError::connection(ENGINE, &target, reason);
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .user_agent(format!("schemaflow/{}", env!("CARGO_PKG_VERSION")));
        if let Some(material) = tls {
            if let Some(ca) = &material.ca {
                let certificate = Certificate::from_pem(ca.as_bytes())
                    .map_err(|e| fail(format!("Invalid CA certificate: {e}")))?;
                builder = builder.add_root_certificate(certificate);
            }
            if let Some((cert, key)) = &material.identity {
                let identity = Identity::from_pem(format!("{cert}\n{key}").as_bytes())
                    .map_err(|e| fail(format!("Invalid client certificate: {e}")))?;
                builder = builder.identity(identity);
            }
        }
        let http = builder
            .build()
            .map_err(|e| fail(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url,
            username: config.username.clone(),
            password: config.password.clone(),
            target,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn redact(&self, text: &str) -> String {
        if self.password.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.password, crate::db::types::REDACTED_PASSWORD)
        }
    }

    async fn send(&self, scope: &Scope<'_>, sql: &str) -> Result<reqwest::Response> {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("output_format_json_quote_64bit_integers", "0");
            if let Some(database) = scope.database {
                query.append_pair("database", database);
            }
            if let Some(session_id) = scope.session_id {
                query.append_pair("session_id", session_id);
            }
        }

        debug!(target_host = %self.target, database = ?scope.database, "ClickHouse query");
        let response = self
            .http
            .post(url)
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| {
                SchemaflowError::connection(ENGINE, &self.target, self.redact(&e.to_string()))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let reason = self.redact(body.trim());
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            || reason.contains("AUTHENTICATION_FAILED")
        {
            return Err(SchemaflowError::connection(ENGINE, &self.target, reason));
        }
        Err(SchemaflowError::query(sql, format!("HTTP {status}: {reason}")))
    }

    pub async fn execute(&self, scope: &Scope<'_>, sql: &str) -> Result<()> {
        let response = self.send(scope, sql).await?;
        // drain so the server-side query completes before we return
        response
            .bytes()
            .await
            .map_err(|e| SchemaflowError::query(sql, self.redact(&e.to_string())))?;
        Ok(())
    }

    /// Raw response body of `sql`, which must name its own output format
    pub async fn text(&self, scope: &Scope<'_>, sql: &str) -> Result<String> {
        let response = self.send(scope, sql).await?;
        response
            .text()
            .await
            .map_err(|e| SchemaflowError::query(sql, self.redact(&e.to_string())))
    }

    /// Rows of `sql` decoded from `JSONEachRow`
    pub async fn rows<T: DeserializeOwned>(&self, scope: &Scope<'_>, sql: &str) -> Result<Vec<T>> {
        let query = format!("{sql} FORMAT JSONEachRow");
        let body = self.text(scope, &query).await?;
        parse_json_rows(&body).map_err(|e| SchemaflowError::query(query, e))
    }

    /// One value per line from `TabSeparatedRaw` output
    pub async fn lines(&self, scope: &Scope<'_>, sql: &str) -> Result<Vec<String>> {
        let body = self
            .text(scope, &format!("{sql} FORMAT TabSeparatedRaw"))
            .await?;
        Ok(body
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stream the response body of `sql` into `out` after `prefix`.
    ///
    /// Nothing is written when the body is empty. Returns whether anything was.
    pub async fn copy_to(
        &self,
        scope: &Scope<'_>,
        sql: &str,
        prefix: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<bool> {
        let mut response = self.send(scope, sql).await?;
        let mut written = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| SchemaflowError::query(sql, self.redact(&e.to_string())))?
        {
            if chunk.is_empty() {
                continue;
            }
            if !written {
                out.write_all(prefix.as_bytes()).await?;
                written = true;
            }
            out.write_all(&chunk).await?;
        }
        Ok(written)
    }
}

pub(super) fn parse_json_rows<T: DeserializeOwned>(body: &str) -> std::result::Result<Vec<T>, String> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| format!("Malformed result row: {e}")))
        .collect()
}

/// ClickHouse string literal
pub(super) fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
