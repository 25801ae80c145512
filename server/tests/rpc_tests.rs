//! End-to-end tests against the raw-KV RPC surface, driving
//! `docdb_server::rpc::serve` over a real TCP socket on an ephemeral port.

use std::sync::Arc;

use docdb::document::ddl::DdlConfig;
use docdb::storage::log_cask::LogCask;
use docdb_server::protocol::{Op, Request, Response, ScanOptions};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_serde::formats::Bincode;
use tokio_util::codec::LengthDelimitedCodec;

type ClientConn = tokio_serde::Framed<
    tokio_util::codec::Framed<TcpStream, LengthDelimitedCodec>,
    Response,
    Request,
    Bincode<Response, Request>,
>;

async fn connect(addr: std::net::SocketAddr) -> ClientConn {
    let socket = TcpStream::connect(addr).await.unwrap();
    let wire = tokio_util::codec::Framed::new(socket, LengthDelimitedCodec::new());
    tokio_serde::Framed::new(wire, Bincode::default())
}

struct TestServer {
    addr: std::net::SocketAddr,
    // Held only to keep the tempdir and the store's background workers
    // alive for the test's duration.
    _dir: tempfile::TempDir,
    _store: Arc<docdb::document::Store<LogCask>>,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let engine = LogCask::new(dir.path().join("docdb.log")).unwrap();
    let store = docdb::document::Store::open(engine, DdlConfig::default()).unwrap();
    let engine = store.engine();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let shutdown = std::future::pending::<()>();
        docdb_server::rpc::serve(listener, engine, shutdown).await.unwrap();
    });
    TestServer { addr, _dir: dir, _store: store }
}

#[tokio::test]
async fn put_get_delete_over_rpc() {
    let server = start_server().await;
    let addr = server.addr;
    let mut conn = connect(addr).await;

    conn.send(Request {
        stream_start: true,
        update: true,
        op: Op::Set { key: b"key1".to_vec(), value: b"value1".to_vec(), meta: None },
    })
    .await
    .unwrap();
    let resp = conn.next().await.unwrap().unwrap();
    assert_eq!(resp.code, docdb_server::protocol::CODE_OK);

    conn.send(Request { stream_start: false, update: true, op: Op::Get { key: b"key1".to_vec() } })
        .await
        .unwrap();
    let resp = conn.next().await.unwrap().unwrap();
    assert_eq!(resp.code, docdb_server::protocol::CODE_OK);
    assert_eq!(resp.value, Some(b"value1".to_vec()));

    conn.send(Request { stream_start: false, update: true, op: Op::Commit }).await.unwrap();
    let resp = conn.next().await.unwrap().unwrap();
    assert_eq!(resp.code, docdb_server::protocol::CODE_OK);

    // Delete in a fresh transaction, then confirm key-not-found.
    conn.send(Request { stream_start: true, update: true, op: Op::Delete { key: b"key1".to_vec() } })
        .await
        .unwrap();
    let resp = conn.next().await.unwrap().unwrap();
    assert_eq!(resp.code, docdb_server::protocol::CODE_OK);
    conn.send(Request { stream_start: false, update: true, op: Op::Commit }).await.unwrap();
    conn.next().await.unwrap().unwrap();

    conn.send(Request { stream_start: true, update: false, op: Op::Get { key: b"key1".to_vec() } })
        .await
        .unwrap();
    let resp = conn.next().await.unwrap().unwrap();
    assert_eq!(resp.code, docdb_server::protocol::CODE_KEY_NOT_FOUND);
}

#[tokio::test]
async fn transactional_scan_with_prefix() {
    let server = start_server().await;
    let addr = server.addr;
    let mut conn = connect(addr).await;

    conn.send(Request { stream_start: true, update: true, op: Op::Set { key: b"other:x".to_vec(), value: vec![255], meta: None } })
        .await
        .unwrap();
    conn.next().await.unwrap().unwrap();

    for i in 0..10u8 {
        let key = format!("unique_prefix:{}", i).into_bytes();
        conn.send(Request { stream_start: false, update: true, op: Op::Set { key, value: vec![i], meta: None } })
            .await
            .unwrap();
        conn.next().await.unwrap().unwrap();
    }
    conn.send(Request { stream_start: false, update: true, op: Op::Commit }).await.unwrap();
    conn.next().await.unwrap().unwrap();

    conn.send(Request {
        stream_start: true,
        update: false,
        op: Op::Scan { options: ScanOptions { reverse: false, prefix: Some(b"unique_prefix".to_vec()), offset: 0, limit: 9 } },
    })
    .await
    .unwrap();
    let resp: Response = conn.next().await.unwrap().unwrap();
    assert_eq!(resp.code, docdb_server::protocol::CODE_OK);
    assert_eq!(resp.entries.len(), 9);
    for (i, (key, value)) in resp.entries.iter().enumerate() {
        assert_eq!(key, &format!("unique_prefix:{}", i).into_bytes());
        assert_eq!(value, &vec![i as u8]);
    }
}
