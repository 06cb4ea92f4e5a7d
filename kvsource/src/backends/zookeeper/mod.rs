//! ZooKeeper backend.
//!
//! Keeps one session open to the first reachable node. Values live in leaf
//! znodes: reading `/app` walks its children recursively and returns the
//! data of every node without children. ZooKeeper watches are one-shot and
//! tied to the session, so prefix watches are simulated by polling.

mod proto;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint, poll_until_changed};

use proto::{
    ConnectRequest, ConnectResponse, ReplyHeader, ERR_NO_NODE, ERR_OK, OP_GET_CHILDREN,
    OP_GET_DATA, OP_PING, XID_PING,
};

/// Session timeout requested from the server.
const SESSION_TIMEOUT_MS: i32 = 30_000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for the ZooKeeper backend.
#[derive(Debug, Clone)]
pub struct ZookeeperParams {
    /// `host:port` entries
    pub nodes: Vec<String>,
    pub poll_interval: Duration,
}

struct Connection {
    stream: TcpStream,
    next_xid: i32,
    session_timeout: Duration,
}

impl Connection {
    async fn open(addr: &str) -> io::Result<Self> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;

        stream
            .write_all(&ConnectRequest::new(SESSION_TIMEOUT_MS).encode())
            .await?;
        let response = ConnectResponse::decode(proto::read_frame(&mut stream).await?)?;
        if response.timeout_ms <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "session rejected by server",
            ));
        }

        debug!(
            addr = %addr,
            session_id = response.session_id,
            timeout_ms = response.timeout_ms,
            "ZooKeeper session established"
        );

        Ok(Self {
            stream,
            next_xid: 1,
            session_timeout: Duration::from_millis(response.timeout_ms as u64),
        })
    }

    async fn call(&mut self, op: i32, path: Option<&str>) -> io::Result<(ReplyHeader, Bytes)> {
        let xid = if op == OP_PING {
            XID_PING
        } else {
            let xid = self.next_xid;
            self.next_xid = self.next_xid.checked_add(1).unwrap_or(1);
            xid
        };

        self.stream
            .write_all(&proto::encode_request(xid, op, path))
            .await?;

        // Skip anything not addressed to this request (stray notifications).
        loop {
            let mut frame = proto::read_frame(&mut self.stream).await?;
            let header = ReplyHeader::decode(&mut frame)?;
            if header.xid == xid {
                return Ok((header, frame));
            }
        }
    }
}

type Slot = Arc<Mutex<Option<Connection>>>;

/// ZooKeeper store client.
pub struct ZookeeperStore {
    nodes: Vec<String>,
    connection: Slot,
    poll_interval: Duration,
}

impl ZookeeperStore {
    /// Connect to the first reachable node and start the session keep-alive.
    pub async fn connect(params: ZookeeperParams) -> Result<Self> {
        if params.nodes.is_empty() {
            return Err(BackendError::MissingField {
                backend: BackendKind::Zookeeper,
                field: "nodes",
            });
        }

        let connection = Self::open_any(&params.nodes)
            .await
            .map_err(|e| BackendError::construction(BackendKind::Zookeeper, e.to_string()))?;
        let ping_every = connection.session_timeout / 3;

        let slot: Slot = Arc::new(Mutex::new(Some(connection)));
        tokio::spawn(keep_alive(Arc::downgrade(&slot), ping_every));

        Ok(Self {
            nodes: params.nodes,
            connection: slot,
            poll_interval: params.poll_interval,
        })
    }

    async fn open_any(nodes: &[String]) -> io::Result<Connection> {
        let mut last_err = io::Error::new(io::ErrorKind::NotConnected, "no nodes configured");
        for node in nodes {
            match Connection::open(node).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(node = %node, error = %e, "ZooKeeper node unreachable");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Issue one request, reconnecting first if the previous session broke.
    async fn call(&self, op: i32, path: &str) -> Result<Option<Bytes>> {
        let mut slot = self.connection.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => Self::open_any(&self.nodes)
                .await
                .map_err(|e| BackendError::unreachable(BackendKind::Zookeeper, e))?,
        };

        let (header, body) = conn
            .call(op, Some(path))
            .await
            .map_err(|e| BackendError::unreachable(BackendKind::Zookeeper, e))?;
        *slot = Some(conn);

        match header.err {
            ERR_OK => Ok(Some(body)),
            ERR_NO_NODE => Ok(None),
            code => Err(BackendError::unreachable(
                BackendKind::Zookeeper,
                format!("server returned error {} for {}", code, path),
            )),
        }
    }

    async fn children(&self, path: &str) -> Result<Option<Vec<String>>> {
        match self.call(OP_GET_CHILDREN, path).await? {
            Some(body) => proto::decode_children(body)
                .map(Some)
                .map_err(|e| BackendError::decode(BackendKind::Zookeeper, e)),
            None => Ok(None),
        }
    }

    async fn data(&self, path: &str) -> Result<Option<String>> {
        match self.call(OP_GET_DATA, path).await? {
            Some(body) => {
                let data = proto::decode_data(body)
                    .map_err(|e| BackendError::decode(BackendKind::Zookeeper, e))?;
                Ok(Some(String::from_utf8_lossy(&data).into_owned()))
            }
            None => Ok(None),
        }
    }

    /// Collect leaf values beneath `root`. Nodes that vanish mid-walk are skipped.
    async fn walk(&self, root: &str, vars: &mut KvPairs) -> Result<()> {
        let mut pending = vec![normalize(root)];

        while let Some(path) = pending.pop() {
            let Some(children) = self.children(&path).await? else {
                continue;
            };

            if children.is_empty() {
                if let Some(value) = self.data(&path).await? {
                    vars.insert(path, value);
                }
                continue;
            }

            for child in children {
                pending.push(if path == "/" {
                    format!("/{}", child)
                } else {
                    format!("{}/{}", path, child)
                });
            }
        }

        Ok(())
    }

    async fn snapshot(&self, keys: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        for key in keys {
            self.walk(key, &mut vars).await?;
        }
        Ok(vars)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Ping at a third of the session timeout until the store is dropped.
async fn keep_alive(slot: Weak<Mutex<Option<Connection>>>, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(slot) = slot.upgrade() else {
            break;
        };
        let mut guard = slot.lock().await;
        if let Some(mut conn) = guard.take() {
            match conn.call(OP_PING, None).await {
                Ok(_) => *guard = Some(conn),
                Err(e) => debug!(error = %e, "ZooKeeper ping failed, reconnecting on next call"),
            }
        }
    }
}

#[async_trait]
impl StoreClient for ZookeeperStore {
    #[instrument(skip(self), fields(backend = "zookeeper"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        if keys.is_empty() {
            return Ok(KvPairs::new());
        }
        self.snapshot(keys).await
    }

    #[instrument(skip(self, stop), fields(backend = "zookeeper"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        let roots = vec![prefix.to_string()];
        let roots = &roots;
        poll_until_changed(
            move || async move {
                let snapshot: KvPairs = self
                    .snapshot(roots)
                    .await?
                    .into_iter()
                    .filter(|(k, _)| key_is_watched(k, keys))
                    .collect();
                Ok(fingerprint(&snapshot))
            },
            wait_index,
            self.poll_interval,
            stop,
        )
        .await
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Zookeeper
    }
}

#[cfg(test)]
mod tests {
    use super::proto::{get_i32, get_string, put_buffer, put_string, STAT_LEN};
    use super::*;
    use bytes::{BufMut, BytesMut};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// In-process server answering reads from a fixed tree.
    async fn fake_server(tree: HashMap<&'static str, (&'static str, Vec<&'static str>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let tree = Arc::new(tree);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let tree = tree.clone();
                tokio::spawn(async move {
                    if proto::read_frame(&mut socket).await.is_err() {
                        return;
                    }
                    let hello = ConnectResponse {
                        protocol_version: 0,
                        timeout_ms: 30_000,
                        session_id: 42,
                        passwd: vec![0; 16],
                    };
                    if socket.write_all(&hello.encode()).await.is_err() {
                        return;
                    }

                    while let Ok(mut frame) = proto::read_frame(&mut socket).await {
                        let xid = get_i32(&mut frame).unwrap();
                        let op = get_i32(&mut frame).unwrap();
                        let mut body = BytesMut::new();
                        let mut header = ReplyHeader { xid, zxid: 1, err: ERR_OK };

                        if op != OP_PING {
                            let path = get_string(&mut frame).unwrap();
                            match (tree.get(path.as_str()), op) {
                                (Some((_, children)), OP_GET_CHILDREN) => {
                                    body.put_i32(children.len() as i32);
                                    for child in children {
                                        put_string(&mut body, child);
                                    }
                                }
                                (Some((data, _)), OP_GET_DATA) => {
                                    put_buffer(&mut body, Some(data.as_bytes()));
                                    body.extend_from_slice(&[0u8; STAT_LEN]);
                                }
                                _ => header.err = ERR_NO_NODE,
                            }
                        }

                        let mut reply = BytesMut::new();
                        header.put(&mut reply);
                        reply.extend_from_slice(&body);
                        if socket.write_all(&proto::frame(reply)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    fn sample_tree() -> HashMap<&'static str, (&'static str, Vec<&'static str>)> {
        HashMap::from([
            ("/app", ("", vec!["db", "name"])),
            ("/app/db", ("", vec!["host", "port"])),
            ("/app/db/host", ("10.0.0.7", vec![])),
            ("/app/db/port", ("5432", vec![])),
            ("/app/name", ("billing", vec![])),
        ])
    }

    async fn store(addr: String) -> ZookeeperStore {
        ZookeeperStore::connect(ZookeeperParams {
            nodes: vec![addr],
            poll_interval: Duration::from_millis(10),
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/app/"), "/app");
        assert_eq!(normalize("app"), "/app");
        assert_eq!(normalize("/"), "/");
    }

    #[tokio::test]
    async fn test_walks_tree() {
        let store = store(fake_server(sample_tree()).await).await;
        let values = store.get_values(&["/app".to_string()]).await.unwrap();

        assert_eq!(values.len(), 3);
        assert_eq!(values["/app/db/host"], "10.0.0.7");
        assert_eq!(values["/app/db/port"], "5432");
        assert_eq!(values["/app/name"], "billing");
    }

    #[tokio::test]
    async fn test_missing_node_is_omitted() {
        let store = store(fake_server(sample_tree()).await).await;
        let values = store
            .get_values(&["/app/name".to_string(), "/nope".to_string()])
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["/app/name"], "billing");
    }

    #[tokio::test]
    async fn test_unreachable_seed_fails_construction() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = ZookeeperStore::connect(ZookeeperParams {
            nodes: vec![addr],
            poll_interval: Duration::from_millis(10),
        })
        .await
        .err()
        .unwrap();
        assert!(err.is_construction_error());
    }

    #[tokio::test]
    async fn test_watch_zero_index_and_stop() {
        let store = store(fake_server(sample_tree()).await).await;
        let stop = StopSignal::new();
        let keys = vec!["/app/db".to_string()];

        let index = store
            .watch_prefix("/app", &keys, 0, &stop)
            .await
            .unwrap()
            .index()
            .unwrap();

        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            canceller.cancel();
        });

        let outcome = store.watch_prefix("/app", &keys, index, &stop).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Cancelled);
    }
}
