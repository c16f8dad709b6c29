//! End-to-end tests against a real listener, speaking raw RESP.

use emberkv::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: std::net::SocketAddr,
    server: Arc<Server>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::start_in(dir).await
    }

    async fn start_in(dir: TempDir) -> Self {
        let config = ServerConfig {
            snapshot_path: dir.path().join("dump.rdb"),
            ..Default::default()
        };
        let server = Arc::new(Server::new(config));
        server.persistence().load().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .run(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        Self {
            addr,
            server,
            stop: Some(stop_tx),
            task: Some(task),
            dir,
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.path().join("dump.rdb")
    }

    async fn connect(&self) -> Client {
        Client {
            stream: TcpStream::connect(self.addr).await.unwrap(),
        }
    }

    async fn stop(mut self) -> TempDir {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
        self.dir
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    /// Sends one command as an array of bulk strings.
    async fn send(&mut self, args: &[&str]) {
        let mut frame = format!("*{}\r\n", args.len());
        for arg in args {
            frame.push_str(&format!("${}\r\n{}\r\n", arg.len(), arg));
        }
        self.stream.write_all(frame.as_bytes()).await.unwrap();
    }

    /// Reads one complete reply frame.
    async fn read_reply(&mut self) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        let deadline = Duration::from_secs(5);

        loop {
            let n = tokio::time::timeout(deadline, self.stream.read(&mut byte))
                .await
                .expect("reply timed out")
                .unwrap();
            if n == 0 {
                break;
            }
            out.push(byte[0]);
            if out.ends_with(b"\r\n") {
                break;
            }
        }

        // Bulk strings carry a payload line after the header.
        if out.first() == Some(&b'$') && out != b"$-1\r\n" {
            let len: usize = std::str::from_utf8(&out[1..out.len() - 2])
                .unwrap()
                .parse()
                .unwrap();
            let mut payload = vec![0u8; len + 2];
            self.stream.read_exact(&mut payload).await.unwrap();
            out.extend_from_slice(&payload);
        }

        String::from_utf8(out).unwrap()
    }

    async fn call(&mut self, args: &[&str]) -> String {
        self.send(args).await;
        self.read_reply().await
    }
}

#[tokio::test]
async fn echo_frame_round_trips() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .stream
        .write_all(b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n")
        .await
        .unwrap();
    assert_eq!(client.read_reply().await, "$5\r\nhello\r\n");

    server.stop().await;
}

#[tokio::test]
async fn basic_commands() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    assert_eq!(client.call(&["PING"]).await, "+PONG\r\n");
    assert_eq!(client.call(&["SET", "name", "ember"]).await, "+OK\r\n");
    assert_eq!(client.call(&["GET", "name"]).await, "$5\r\nember\r\n");
    assert_eq!(client.call(&["GET", "nope"]).await, "$-1\r\n");
    assert_eq!(client.call(&["INCR", "n"]).await, ":1\r\n");
    assert_eq!(client.call(&["DECR", "n"]).await, ":0\r\n");
    assert_eq!(client.call(&["LPUSH", "l", "a", "b", "c"]).await, ":3\r\n");
    assert_eq!(client.call(&["RPUSH", "l", "d"]).await, ":4\r\n");
    assert_eq!(client.call(&["EXISTS", "name", "l", "zzz"]).await, ":2\r\n");
    assert_eq!(client.call(&["DEL", "name", "l"]).await, ":2\r\n");
    assert_eq!(
        client.call(&["GET", "n", "extra"]).await,
        "-ERR wrong number of arguments for 'get' command\r\n"
    );
    assert_eq!(
        client.call(&["HSET", "h", "f", "v"]).await,
        "-ERR unknown command 'HSET'\r\n"
    );

    server.stop().await;
}

#[tokio::test]
async fn expired_keys_are_invisible() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    assert_eq!(client.call(&["SET", "gone", "v", "EX", "-5"]).await, "+OK\r\n");
    assert_eq!(client.call(&["GET", "gone"]).await, "$-1\r\n");
    assert_eq!(client.call(&["EXISTS", "gone"]).await, ":0\r\n");

    assert_eq!(client.call(&["SET", "brief", "v", "PX", "30"]).await, "+OK\r\n");
    assert_eq!(client.call(&["GET", "brief"]).await, "$1\r\nv\r\n");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.call(&["GET", "brief"]).await, "$-1\r\n");

    server.stop().await;
}

#[tokio::test]
async fn bad_array_length_gets_error_and_close() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.stream.write_all(b"*x\r\n").await.unwrap();
    let reply = client.read_reply().await;
    assert!(reply.starts_with("-ERR Protocol error: "), "got {:?}", reply);

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed");

    // Other clients are unaffected.
    let mut other = server.connect().await;
    assert_eq!(other.call(&["PING"]).await, "+PONG\r\n");

    server.stop().await;
}

#[tokio::test]
async fn concurrent_incr_over_tcp() {
    const CLIENTS: usize = 10;
    const PER_CLIENT: usize = 200;

    let server = TestServer::start().await;

    let tasks: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let addr = server.addr;
            tokio::spawn(async move {
                let mut client = Client {
                    stream: TcpStream::connect(addr).await.unwrap(),
                };
                for _ in 0..PER_CLIENT {
                    let reply = client.call(&["INCR", "hits"]).await;
                    assert!(reply.starts_with(':'), "got {:?}", reply);
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let mut client = server.connect().await;
    let expected = (CLIENTS * PER_CLIENT).to_string();
    assert_eq!(
        client.call(&["GET", "hits"]).await,
        format!("${}\r\n{}\r\n", expected.len(), expected)
    );

    server.stop().await;
}

#[tokio::test]
async fn save_survives_restart() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.call(&["SET", "greeting", "hello"]).await;
    client.call(&["SET", "session", "abc", "EX", "3600"]).await;
    client.call(&["RPUSH", "queue", "a", "b", "c"]).await;
    client.call(&["INCR", "counter"]).await;
    assert_eq!(client.call(&["SAVE"]).await, "+OK\r\n");
    assert!(server.snapshot_path().exists());
    assert_eq!(server.server.storage().dirty(), 0);

    let dir = server.stop().await;
    let restarted = TestServer::start_in(dir).await;
    let mut client = restarted.connect().await;

    assert_eq!(client.call(&["GET", "greeting"]).await, "$5\r\nhello\r\n");
    assert_eq!(client.call(&["GET", "session"]).await, "$3\r\nabc\r\n");
    assert_eq!(client.call(&["GET", "counter"]).await, "$1\r\n1\r\n");
    assert_eq!(client.call(&["RPUSH", "queue", "d"]).await, ":4\r\n");
    assert_eq!(
        restarted.server.storage().list_items(b"queue").unwrap().unwrap(),
        vec!["a", "b", "c", "d"]
    );

    restarted.stop().await;
}

#[tokio::test]
async fn bgsave_replies_immediately_and_writes() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.call(&["SET", "k", "v"]).await;
    assert_eq!(
        client.call(&["BGSAVE"]).await,
        "+Background saving started\r\n"
    );

    let path = server.snapshot_path();
    let dir = server.stop().await;
    assert!(path.exists());
    drop(dir);
}

#[tokio::test]
async fn save_schedule_parameters() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    assert_eq!(
        client.call(&["SAVE", "abc", "1"]).await,
        "-ERR invalid number format\r\n"
    );
    assert_eq!(
        client.call(&["SAVE", "-1", "1"]).await,
        "-ERR invalid save parameters\r\n"
    );
    assert_eq!(client.call(&["SAVE", "1", "1"]).await, "+OK\r\n");

    client.call(&["SET", "k", "v"]).await;

    let path = server.snapshot_path();
    let mut waited = Duration::ZERO;
    while !path.exists() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert!(path.exists(), "background loop never saved");

    server.stop().await;
}
