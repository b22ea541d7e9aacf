//! One long-lived monitoring session per database (NB, SB, local OVS),
//! each a JSON-RPC-over-stream connection (SSL or TCP, spec §6). This
//! module owns the wire: request/response correlation, the monitor
//! notification loop that feeds `schema::Monitor`, and reconnect-on-error
//! using the same rehydrate-and-replay shape as
//! `storage/src/client/controller/rehydration.rs`'s `RehydrationTask`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use oh_util::error::Error;
use oh_util::retry::Retry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::schema::Monitor;

/// A single JSON-RPC request per the OVSDB protocol.
#[derive(Serialize)]
struct Request {
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Deserialize)]
struct Response {
    id: Option<u64>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<Value>,
    /// Notifications (monitor updates) carry `method` instead of `id`.
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// Abstracts the wire so the retry/UUID discipline in `transaction.rs` and
/// the typed operations in `nb.rs`/`sb.rs`/`ovs.rs` can be exercised
/// against an in-memory fake without a live database.
#[async_trait]
pub trait OvsdbConnection: Send + Sync {
    /// Issues a `transact` call against `database` with the given OVSDB
    /// operations and returns the raw per-operation JSON results.
    async fn transact(&self, database: &str, ops: Vec<Value>) -> Result<Vec<Value>, Error>;

    /// The monitored replica fed by this connection's `monitor`
    /// subscription.
    fn monitor(&self) -> &Monitor;
}

/// A concrete JSON-RPC-over-TCP connection with reconnect-on-error.
pub struct TcpOvsdbConnection {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    monitor: Arc<Monitor>,
    next_id: AtomicU64,
}

enum SessionCommand {
    Send { request: Value, respond_to: oneshot::Sender<Result<Value, Error>> },
}

impl TcpOvsdbConnection {
    /// Connects to `addr` (already resolved `host:port`) and begins the
    /// session task. `schema` is the OVSDB schema name (`OVN_Northbound`,
    /// `OVN_Southbound`, `Open_vSwitch`) used for the initial `monitor`
    /// call's database argument.
    pub async fn connect(addr: String, schema: &'static str) -> Result<TcpOvsdbConnection, Error> {
        let monitor = Arc::new(Monitor::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            addr,
            schema,
            command_rx,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            monitor: Arc::clone(&monitor),
        };
        // Establish the first connection synchronously so callers observe
        // connect failures immediately rather than only on first use.
        session.connect_once().await?;
        tokio::spawn(async move { session.run().await });
        Ok(TcpOvsdbConnection { command_tx, monitor, next_id: AtomicU64::new(1) })
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_value(Request { id, method, params }).expect("request is always serializable");
        let (respond_to, recv) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Send { request, respond_to })
            .map_err(|_| Error::Other(anyhow::anyhow!("ovsdb session task terminated")))?;
        recv.await.map_err(|_| Error::Other(anyhow::anyhow!("ovsdb session dropped the response channel")))?
    }
}

#[async_trait]
impl OvsdbConnection for TcpOvsdbConnection {
    async fn transact(&self, database: &str, ops: Vec<Value>) -> Result<Vec<Value>, Error> {
        let mut params = vec![Value::String(database.to_string())];
        params.extend(ops);
        let result = self.call("transact", Value::Array(params)).await?;
        match result {
            Value::Array(results) => Ok(results),
            other => Err(Error::CommitError(format!("unexpected transact reply: {other}"))),
        }
    }

    fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

/// Owns the actual socket and multiplexes requests/notifications over it.
struct Session {
    addr: String,
    schema: &'static str,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    pending: Arc<Mutex<BTreeMap<u64, oneshot::Sender<Result<Value, Error>>>>>,
    monitor: Arc<Monitor>,
}

impl Session {
    async fn connect_once(&mut self) -> Result<TcpStream, Error> {
        TcpStream::connect(&self.addr).await.map_err(|e| Error::Transport {
            host: self.addr.clone(),
            cmd: "connect".into(),
            source: e.into(),
        })
    }

    async fn run(&mut self) {
        let retry = Retry::default().clamp_backoff(Duration::from_secs(32)).into_retry_stream();
        tokio::pin!(retry);
        loop {
            let stream = loop {
                match self.connect_once().await {
                    Ok(s) => break s,
                    Err(e) => {
                        tracing::warn!(addr = %self.addr, error = %e, "reconnecting to ovsdb");
                        retry.next().await;
                    }
                }
            };
            let (mut reader, mut writer) = stream.into_split();
            if let Err(e) = send_monitor_request(&mut writer, self.schema).await {
                tracing::warn!(error = %e, "failed to start monitor session, retrying");
                continue;
            }

            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            'pump: loop {
                tokio::select! {
                    command = self.command_rx.recv() => {
                        match command {
                            None => return,
                            Some(SessionCommand::Send { request, respond_to }) => {
                                let id = request.get("id").and_then(Value::as_u64);
                                if let Some(id) = id {
                                    self.pending.lock().unwrap().insert(id, respond_to);
                                }
                                let mut bytes = serde_json::to_vec(&request).expect("request serializes");
                                if writer.write_all(&mut bytes).await.is_err() {
                                    break 'pump;
                                }
                            }
                        }
                    }
                    n = reader.read(&mut chunk) => {
                        match n {
                            Ok(0) | Err(_) => break 'pump,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                self.drain_messages(&mut buf);
                            }
                        }
                    }
                }
            }
            // Fail every still-pending request so callers see the
            // ambiguous-commit window rather than hanging forever.
            for (_, sender) in self.pending.lock().unwrap().split_off(&0) {
                let _ = sender.send(Err(Error::Other(anyhow::anyhow!(
                    "connection lost mid-request; outcome is ambiguous"
                ))));
            }
        }
    }

    /// Parses as many complete JSON values as are currently buffered and
    /// dispatches each as either a response (has `id`) or a notification
    /// (has `method`, e.g. `update3`).
    fn drain_messages(&self, buf: &mut Vec<u8>) {
        loop {
            let mut de = serde_json::Deserializer::from_slice(buf).into_iter::<Response>();
            match de.next() {
                Some(Ok(msg)) => {
                    let consumed = de.byte_offset();
                    drop(de);
                    buf.drain(..consumed);
                    self.dispatch(msg);
                }
                _ => break,
            }
        }
    }

    fn dispatch(&self, msg: Response) {
        if let Some(id) = msg.id {
            if let Some(sender) = self.pending.lock().unwrap().remove(&id) {
                let outcome = match msg.error {
                    Some(e) => Err(Error::CommitError(e.to_string())),
                    None => Ok(msg.result),
                };
                let _ = sender.send(outcome);
            }
            return;
        }
        if msg.method.as_deref() == Some("update3") || msg.method.as_deref() == Some("update2") || msg.method.as_deref() == Some("update") {
            apply_monitor_params(&self.monitor, msg.params);
        }
    }
}

async fn send_monitor_request<W: AsyncWriteExt + Unpin>(writer: &mut W, schema: &'static str) -> Result<(), Error> {
    let request = Request {
        id: 0,
        method: "monitor_cond_since",
        params: serde_json::json!([schema, Uuid::nil(), Value::Null, Uuid::nil()]),
    };
    let bytes = serde_json::to_vec(&request).map_err(|e| Error::Other(e.into()))?;
    writer.write_all(&bytes).await.map_err(|e| Error::Other(e.into()))
}

/// Applies a `{table: {row_uuid: {new: {...}}}}`-shaped monitor
/// notification payload into the schema mirror. The exact encoding
/// (`update`/`update2`/`update3`) differs in how deletes/modifies are
/// represented; all three agree that a present `"new"` (or bare row
/// object for `update`) means insert-or-modify and its absence means
/// delete.
fn apply_monitor_params(monitor: &Monitor, params: Value) {
    let Value::Array(items) = params else { return };
    // params[1] is the table-update document for `update`/`update2`/`update3`.
    let Some(table_updates) = items.get(1).or_else(|| items.get(0)) else { return };
    let Value::Object(tables) = table_updates else { return };
    for (table, rows) in tables {
        let Value::Object(rows) = rows else { continue };
        for (row_id, row_update) in rows {
            let Ok(uuid) = row_id.parse::<Uuid>() else { continue };
            let new_value = row_update
                .get("new")
                .or_else(|| row_update.get("insert"))
                .or_else(|| row_update.get("modify"))
                .cloned()
                .or_else(|| if row_update.get("delete").is_some() { None } else { Some(row_update.clone()) });
            monitor.apply_update(table, uuid, new_value);
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// An in-memory `OvsdbConnection` used by `nb.rs`/`sb.rs`/`ovs.rs`
    /// unit tests: `transact` is driven entirely by a caller-supplied
    /// script of responses, one per call, so tests can simulate
    /// `TransientDisconnect`/`Conflict`/`CommitError` deterministically.
    pub struct ScriptedConnection {
        pub responses: StdMutex<std::collections::VecDeque<Result<Vec<Value>, Error>>>,
        pub monitor: Monitor,
        pub calls: StdMutex<Vec<(String, Vec<Value>)>>,
    }

    impl ScriptedConnection {
        pub fn new(responses: Vec<Result<Vec<Value>, Error>>) -> ScriptedConnection {
            ScriptedConnection {
                responses: StdMutex::new(responses.into()),
                monitor: Monitor::new(),
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OvsdbConnection for ScriptedConnection {
        async fn transact(&self, database: &str, ops: Vec<Value>) -> Result<Vec<Value>, Error> {
            self.calls.lock().unwrap().push((database.to_string(), ops.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Other(anyhow::anyhow!("scripted connection exhausted"))))
        }

        fn monitor(&self) -> &Monitor {
            &self.monitor
        }
    }
}
