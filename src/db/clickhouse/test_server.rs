//! In-process stand-in for the ClickHouse HTTP interface.
//!
//! It understands the statements [`HistoryTable`](super::history::HistoryTable)
//! issues against the history table, answers catalog reads with empty results
//! and records every other statement as applied.

use super::client::quote_string;
use super::history::HistoryRow;
use crate::context::OperationContext;
use crate::db::types::ConnectionConfig;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const OK: &str = "200 OK";
const BAD_REQUEST: &str = "400 Bad Request";

#[derive(Default)]
struct ServerState {
    history_exists: bool,
    inserts: Vec<HistoryRow>,
    statements: Vec<String>,
    failing: Option<String>,
    cancel_after: Option<(String, OperationContext)>,
    armed: Option<OperationContext>,
}

impl ServerState {
    /// One row per `(namespace, sequence)`, newest `updated_ts` wins
    fn final_rows(&self) -> Vec<HistoryRow> {
        let mut latest: BTreeMap<(String, i64), &HistoryRow> = BTreeMap::new();
        for row in &self.inserts {
            let key = (row.namespace.clone(), row.sequence);
            match latest.get(&key) {
                Some(current) if current.updated_ts >= row.updated_ts => {}
                _ => {
                    latest.insert(key, row);
                }
            }
        }
        latest.into_values().cloned().collect()
    }

    fn respond(&mut self, sql: &str) -> (&'static str, String) {
        if let Some(ctx) = self.armed.take() {
            ctx.cancel();
        }

        if sql.starts_with("EXISTS TABLE") {
            return (OK, format!("{}\n", u8::from(self.history_exists)));
        }
        if sql.contains("migration_history") {
            return self.history_query(sql);
        }
        if sql.starts_with("SELECT 1")
            || sql.starts_with("CREATE DATABASE")
            || sql.contains("system.tables")
        {
            return (OK, String::new());
        }

        if self.failing.as_deref() == Some(sql) {
            return (BAD_REQUEST, "Code: 62. DB::Exception: Syntax error".to_string());
        }
        self.statements.push(sql.to_string());
        let trigger = self
            .cancel_after
            .as_ref()
            .filter(|(statement, _)| statement == sql)
            .map(|(_, ctx)| ctx.clone());
        if trigger.is_some() {
            self.armed = trigger;
        }
        (OK, String::new())
    }

    fn history_query(&mut self, sql: &str) -> (&'static str, String) {
        if sql.starts_with("CREATE TABLE") {
            self.history_exists = true;
            return (OK, String::new());
        }
        if sql.starts_with("INSERT INTO") {
            let json = sql.split_once('\n').map(|(_, json)| json).unwrap_or_default();
            return match serde_json::from_str::<HistoryRow>(json) {
                Ok(row) => {
                    self.inserts.push(row);
                    (OK, String::new())
                }
                Err(e) => (BAD_REQUEST, e.to_string()),
            };
        }

        let rows: Vec<HistoryRow> = self
            .final_rows()
            .into_iter()
            .filter(|row| matches_filter(sql, row))
            .collect();
        if sql.contains("max(sequence)") {
            let max = rows.iter().map(|r| r.sequence).max().unwrap_or(0);
            return (OK, format!("{{\"max_sequence\":{max}}}\n"));
        }
        let body = rows
            .iter()
            .filter_map(|row| serde_json::to_string(row).ok())
            .map(|line| line + "\n")
            .collect();
        (OK, body)
    }
}

fn matches_filter(sql: &str, row: &HistoryRow) -> bool {
    let filter = sql.split_once(" WHERE ").map(|(_, w)| w).unwrap_or_default();
    let column = |name: &str, value: &str| {
        !filter.contains(&format!("{name} = "))
            || filter.contains(&format!("{name} = {}", quote_string(value)))
    };
    column("namespace", &row.namespace)
        && column("version", &row.version)
        && column("status", &row.status)
}

pub(super) struct FakeClickHouse {
    state: Arc<Mutex<ServerState>>,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl FakeClickHouse {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("listener address");
        let state = Arc::new(Mutex::new(ServerState::default()));
        let shared = state.clone();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });
        Self {
            state,
            addr,
            server,
        }
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.addr.ip().to_string()).with_port(self.addr.port())
    }

    /// Every history row written, in write order
    pub fn inserts(&self) -> Vec<HistoryRow> {
        self.state.lock().inserts.clone()
    }

    /// History as a `FINAL` read sees it
    pub fn history(&self) -> Vec<HistoryRow> {
        self.state.lock().final_rows()
    }

    /// Statements applied outside the history table
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn fail_statement(&self, statement: &str) {
        self.state.lock().failing = Some(statement.to_string());
    }

    /// Cancel `ctx` when the request following `statement` arrives
    pub fn cancel_after(&self, statement: &str, ctx: &OperationContext) {
        self.state.lock().cancel_after = Some((statement.to_string(), ctx.clone()));
    }

    /// Preload a history row, creating the table
    pub fn seed(&self, row: HistoryRow) {
        let mut state = self.state.lock();
        state.history_exists = true;
        state.inserts.push(row);
    }
}

impl Drop for FakeClickHouse {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let mut content_length = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await?;
    let sql = String::from_utf8_lossy(&body);
    let (status, payload) = state.lock().respond(sql.trim());

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
