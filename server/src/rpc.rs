//! Raw-KV RPC server: a length-delimited, bincode-framed TCP protocol where
//! each connection drives at most one KV transaction at a time. The first
//! frame on a connection opens the transaction (read-only or read-write, per
//! its `update` flag); subsequent frames operate against it until `Commit`,
//! `Discard`, or the peer closing the socket (treated as an implicit
//! `Discard`).

use std::sync::Arc;

use docdb::error::Error as CoreError;
use docdb::mvcc::transaction::{Transaction, TransactionDef};
use docdb::storage::engine::Engine;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_serde::formats::Bincode;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::LengthDelimitedCodec;

use crate::protocol::{code_for_error, Op, Request, Response, CODE_INVALID_REQUEST, MAX_SCAN_LIMIT};

type WireFrame = tokio_util::codec::Framed<TcpStream, LengthDelimitedCodec>;
type Conn = tokio_serde::Framed<WireFrame, Request, Response, Bincode<Request, Response>>;

/// Runs the RPC listener until `shutdown` resolves. Each accepted connection
/// is handled on its own task against a transaction opened on `engine`.
pub async fn serve<E: Engine + 'static>(
    listener: TcpListener,
    engine: Arc<std::sync::Mutex<E>>,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut incoming = TcpListenerStream::new(listener).take_until(shutdown);
    while let Some(accepted) = incoming.next().await {
        let socket = accepted?;
        let peer = socket.peer_addr().ok();
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, engine).await {
                warn!("rpc connection {:?} ended with error: {}", peer, e);
            }
        });
    }
    info!("rpc listener shutting down");
    Ok(())
}

fn framed(socket: TcpStream) -> Conn {
    let wire = tokio_util::codec::Framed::new(socket, LengthDelimitedCodec::new());
    tokio_serde::Framed::new(wire, Bincode::default())
}

async fn handle_connection<E: Engine + 'static>(
    socket: TcpStream,
    engine: Arc<std::sync::Mutex<E>>,
) -> anyhow::Result<()> {
    let mut conn = framed(socket);
    let mut txn: Option<Transaction<E>> = None;

    while let Some(frame) = conn.next().await {
        let request = match frame {
            Ok(r) => r,
            Err(e) => {
                debug!("rpc decode error: {}", e);
                break;
            }
        };

        if request.stream_start {
            let fresh = if request.update {
                Transaction::begin(engine.clone())
            } else {
                Transaction::begin_read_only(engine.clone(), None)
            };
            txn = match fresh {
                Ok(t) => Some(t),
                Err(e) => {
                    conn.send(Response::error(code_for_error(&e), e.to_string())).await?;
                    continue;
                }
            };
        }

        let response = match &request.op {
            Op::Commit | Op::Discard => {
                let ended = txn.take();
                match ended {
                    None => Response::error(CODE_INVALID_REQUEST, "no active transaction"),
                    Some(t) => {
                        let result = if matches!(request.op, Op::Commit) { t.commit() } else { t.rollback() };
                        to_response(result.map(|_| Response::ok()))
                    }
                }
            }
            op => match &txn {
                None => Response::error(CODE_INVALID_REQUEST, "no active transaction"),
                Some(t) => to_response(apply(t, op)),
            },
        };

        let is_discard = matches!(request.op, Op::Discard);
        if !is_discard {
            conn.send(response).await?;
        }
        if txn.is_none() && matches!(request.op, Op::Commit | Op::Discard) {
            // Stream ends with the transaction.
            break;
        }
    }

    // Peer closed mid-transaction: treated as an implicit Discard.
    if let Some(t) = txn.take() {
        t.rollback().ok();
    }
    Ok(())
}

fn apply<E: Engine>(txn: &Transaction<E>, op: &Op) -> Result<Response, CoreError> {
    match op {
        Op::Set { key, value, meta: _ } => {
            txn.set(key, value.clone())?;
            Ok(Response::ok())
        }
        Op::Exists { key } => {
            let exists = txn.get(key)?.is_some();
            Ok(Response { exists, ..Response::ok() })
        }
        Op::Get { key } => match txn.get(key)? {
            Some(value) => Ok(Response { value: Some(value), ..Response::ok() }),
            None => Err(CoreError::KeyNotFound),
        },
        Op::Delete { key } => {
            txn.delete(key)?;
            Ok(Response::ok())
        }
        Op::Scan { options } => {
            let limit = options.limit.min(MAX_SCAN_LIMIT) as usize;
            let mut scan = match &options.prefix {
                Some(prefix) => txn.scan_prefix(prefix)?,
                None => txn.scan((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded))?,
            };
            let iter = scan.scan()?;
            let items: Vec<(Vec<u8>, Vec<u8>)> = if options.reverse {
                iter.rev().skip(options.offset as usize).take(limit).collect::<Result<_, _>>()?
            } else {
                iter.skip(options.offset as usize).take(limit).collect::<Result<_, _>>()?
            };
            Ok(Response { entries: items, ..Response::ok() })
        }
        Op::Commit | Op::Discard => unreachable!("handled by the caller"),
    }
}

fn to_response(result: Result<Response, CoreError>) -> Response {
    match result {
        Ok(r) => r,
        Err(e) => Response::error(code_for_error(&e), e.to_string()),
    }
}
