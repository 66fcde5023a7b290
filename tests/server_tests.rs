//! End-to-end tests running a real server on an ephemeral port.

use std::future::pending;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use snapkv::client::Client;
use snapkv::config::Config;
use snapkv::server;

async fn start_server(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(server::run(listener, config, pending::<()>()));

    addr
}

fn test_config(dir: &TempDir) -> Config {
    Config {
        port: 0,
        dir: dir.path().to_str().unwrap().to_string(),
        dbfilename: "dump.rdb".to_string(),
    }
}

async fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).await.unwrap();

    assert_eq!(
        buf,
        expected,
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&buf)
    );
}

#[tokio::test]
async fn ping_echoes_its_argument() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n")
        .await
        .unwrap();

    expect_reply(&mut stream, b"$2\r\nhi\r\n").await;
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .await
        .unwrap();
    expect_reply(&mut stream, b"+OK\r\n").await;

    stream
        .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
        .await
        .unwrap();
    expect_reply(&mut stream, b"$1\r\nv\r\n").await;
}

#[tokio::test]
async fn non_utf8_keys_round_trip() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*3\r\n$3\r\nSET\r\n$2\r\n\xff\x00\r\n$1\r\nv\r\n")
        .await
        .unwrap();
    expect_reply(&mut stream, b"+OK\r\n").await;

    stream
        .write_all(b"*2\r\n$3\r\nGET\r\n$2\r\n\xff\x00\r\n")
        .await
        .unwrap();
    expect_reply(&mut stream, b"$1\r\nv\r\n").await;
}

#[tokio::test]
async fn get_of_missing_key_is_null() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*2\r\n$3\r\nGET\r\n$7\r\nmissing\r\n")
        .await
        .unwrap();
    expect_reply(&mut stream, b"$-1\r\n").await;
}

#[tokio::test]
async fn set_with_px_expires() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut client = Client::connect(addr).await.unwrap();

    client
        .set_px("k", Bytes::from_static(b"v"), 100)
        .await
        .unwrap();

    assert_eq!(
        client.get("k").await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );

    sleep(Duration::from_millis(200)).await;

    assert_eq!(client.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn keys_lists_the_wildcard_set() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut client = Client::connect(addr).await.unwrap();

    client.set("a", Bytes::from_static(b"1")).await.unwrap();
    client.set("b", Bytes::from_static(b"2")).await.unwrap();

    let mut keys = client.keys("*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

    // only the bare wildcard is supported
    assert!(client.keys("a*").await.unwrap().is_empty());
}

#[tokio::test]
async fn config_get_returns_configured_dir() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let expected_dir = config.dir.clone();
    let addr = start_server(config).await;

    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(
        client.config_get("dir").await.unwrap(),
        Some(("dir".to_string(), expected_dir))
    );
    assert_eq!(client.config_get("maxmemory").await.unwrap(), None);
}

#[tokio::test]
async fn save_then_restart_preserves_dataset() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let addr = start_server(config.clone()).await;
    let mut client = Client::connect(addr).await.unwrap();

    client.set("foo", Bytes::from_static(b"bar")).await.unwrap();
    client.set("n", Bytes::from_static(b"42")).await.unwrap();
    client.save().await.unwrap();

    // a fresh server instance hydrates from the snapshot
    let addr = start_server(config).await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(
        client.get("foo").await.unwrap(),
        Some(Bytes::from_static(b"bar"))
    );
    assert_eq!(
        client.get("n").await.unwrap(),
        Some(Bytes::from_static(b"42"))
    );
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n")
        .await
        .unwrap();

    expect_reply(&mut stream, b"+PONG\r\n+PONG\r\n").await;
}

#[tokio::test]
async fn unknown_command_reports_its_name() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*1\r\n$5\r\nFLUSH\r\n")
        .await
        .unwrap();

    expect_reply(&mut stream, b"-ERR unknown command 'FLUSH'\r\n").await;
}

#[tokio::test]
async fn wrong_arity_is_an_error_reply() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"*1\r\n$3\r\nGET\r\n").await.unwrap();
    expect_reply(
        &mut stream,
        b"-ERR wrong number of arguments for 'get' command\r\n",
    )
    .await;

    // the connection stays usable after a command error
    stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
    expect_reply(&mut stream, b"+PONG\r\n").await;
}

#[tokio::test]
async fn non_integer_px_is_an_error_reply() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nPX\r\n$4\r\nsoon\r\n")
        .await
        .unwrap();

    expect_reply(&mut stream, b"-ERR value is not an integer or out of range\r\n").await;
}

#[tokio::test]
async fn request_split_across_reads_is_reassembled() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(test_config(&dir)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"*2\r\n$4\r\nPI").await.unwrap();
    stream.flush().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    stream.write_all(b"NG\r\n$2\r\nhi\r\n").await.unwrap();

    expect_reply(&mut stream, b"$2\r\nhi\r\n").await;
}
