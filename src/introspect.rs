//! Introspection surface.
//!
//! The scheduler's read-only state (transaction history, key timelines,
//! graph snapshots, flag statistics, dumps) plus the downstream-resync
//! trigger, exposed as serde request/response types served over a Unix
//! domain socket with newline-delimited JSON. Time arguments are Unix
//! seconds.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{render_value, CommitOptions, ValueOrigin};
use crate::graph::{FlagKind, FlagStats, RecordedNode};
use crate::scheduler::recorder::RecordedTxn;
use crate::scheduler::utils::unix_secs_to_ms;
use crate::scheduler::{RecordedOp, Scheduler};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Decode(String),
}

/// One introspection request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    /// Recorded transactions, by sequence number or time window
    /// (Unix seconds).
    #[serde(rename_all = "kebab-case")]
    TxnHistory {
        #[serde(default)]
        seq_num: Option<u64>,
        #[serde(default)]
        since: Option<u64>,
        #[serde(default)]
        until: Option<u64>,
    },
    /// Ordered history of one key.
    KeyTimeline { key: String },
    /// Graph state at a point in time (now when omitted).
    GraphSnapshot {
        #[serde(default)]
        time: Option<u64>,
    },
    /// Flag occurrence counts, optionally restricted to key prefixes.
    FlagStats {
        flag: String,
        #[serde(default)]
        prefix: Vec<String>,
    },
    /// Trigger a downstream resync.
    DownstreamResync,
    /// Dump values under one descriptor: southbound state by default, the
    /// scheduler's internal view with `internal`.
    Dump {
        descriptor: String,
        #[serde(default)]
        internal: bool,
    },
}

/// Rendered key-value pair returned by dumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpEntry {
    pub key: String,
    pub value: String,
    pub origin: ValueOrigin,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    TxnHistory(Vec<RecordedTxn>),
    Timeline(Vec<RecordedNode>),
    FlagStats(FlagStats),
    Resync { seq_num: u64, executed: Vec<RecordedOp> },
    Dump(Vec<DumpEntry>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Response {
    Ok { payload: ResponsePayload },
    Error { error: String },
}

impl Response {
    fn err(error: impl ToString) -> Self {
        Response::Error {
            error: error.to_string(),
        }
    }
}

/// Serve one introspection request against the scheduler.
pub fn handle_request(scheduler: &Scheduler, request: Request) -> Response {
    match request {
        Request::TxnHistory {
            seq_num,
            since,
            until,
        } => {
            // sequence number takes precedence over the time window
            if let Some(seq) = seq_num {
                return match scheduler.get_recorded_transaction(seq) {
                    Some(txn) => Response::Ok {
                        payload: ResponsePayload::TxnHistory(vec![txn]),
                    },
                    None => Response::err("transaction with such sequence is not recorded"),
                };
            }
            let history = scheduler
                .get_transaction_history(since.map(unix_secs_to_ms), until.map(unix_secs_to_ms));
            Response::Ok {
                payload: ResponsePayload::TxnHistory(history),
            }
        }
        Request::KeyTimeline { key } => Response::Ok {
            payload: ResponsePayload::Timeline(scheduler.get_node_timeline(&key)),
        },
        Request::GraphSnapshot { time } => Response::Ok {
            payload: ResponsePayload::Timeline(
                scheduler.get_graph_snapshot(time.map(unix_secs_to_ms)),
            ),
        },
        Request::FlagStats { flag, prefix } => match FlagKind::from_str(&flag) {
            Ok(kind) => {
                let stats = scheduler.get_flag_stats(kind, |key| {
                    prefix.is_empty() || prefix.iter().any(|p| key.starts_with(p.as_str()))
                });
                Response::Ok {
                    payload: ResponsePayload::FlagStats(stats),
                }
            }
            Err(()) => Response::err(format!("unknown flag: {flag}")),
        },
        Request::DownstreamResync => {
            let txn = scheduler.start_nb_transaction();
            match txn.commit(CommitOptions::new().with_downstream_resync()) {
                Ok(result) => {
                    if let Some(failed) = result.kv_errors.first() {
                        return Response::err(format!(
                            "resync failed for {}: {}",
                            failed.key,
                            failed
                                .error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_default()
                        ));
                    }
                    let executed = scheduler
                        .get_recorded_transaction(result.seq_num)
                        .map(|t| t.executed)
                        .unwrap_or_default();
                    Response::Ok {
                        payload: ResponsePayload::Resync {
                            seq_num: result.seq_num,
                            executed,
                        },
                    }
                }
                Err(err) => Response::err(err),
            }
        }
        Request::Dump {
            descriptor,
            internal,
        } => match scheduler.dump_values(&descriptor, internal) {
            Ok(dump) => Response::Ok {
                payload: ResponsePayload::Dump(
                    dump.into_iter()
                        .map(|kv| DumpEntry {
                            key: kv.key,
                            value: render_value(&kv.value),
                            origin: kv.origin,
                        })
                        .collect(),
                ),
            },
            Err(err) => Response::err(err),
        },
    }
}

/// Bind the introspection socket and serve until the listener fails.
/// One thread per connection; requests and responses are JSON lines.
pub fn serve(scheduler: Arc<Scheduler>, socket: &Path) -> Result<(), IpcError> {
    // remove a stale socket from a previous run
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket)?;
    info!("introspection listening on {:?}", socket);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || handle_client(stream, &scheduler));
            }
            Err(e) => warn!("introspection accept error: {e}"),
        }
    }
    Ok(())
}

fn handle_client(stream: UnixStream, scheduler: &Scheduler) {
    let Ok(write_half) = stream.try_clone() else {
        return;
    };
    let reader = BufReader::new(stream);
    let mut writer = write_half;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(scheduler, request),
            Err(e) => Response::err(IpcError::Decode(e.to_string())),
        };
        let Ok(mut encoded) = serde_json::to_vec(&response) else {
            break;
        };
        encoded.push(b'\n');
        if writer.write_all(&encoded).is_err() {
            break;
        }
    }
}
