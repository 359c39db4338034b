//! Shared test fixtures: scripted change logs, scripted transports, and
//! real localhost peer endpoints.

use relay_engine::binlog::{
    BinlogManager, BinlogReader, BoxFuture, ChangeLogRecord, ReadBatch, RecordOp,
};
use relay_engine::codec::Reply;
use relay_engine::error::RelayError;
use relay_engine::net::{Connector, Link, LinkTimeouts};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// =============================================================================
// Scripted change log
// =============================================================================

/// One step a scripted reader serves.
pub enum ReadStep {
    /// Records plus the reader position after consuming them.
    Batch(Vec<ChangeLogRecord>, (u64, u64)),
    /// A non-graceful read failure.
    Error(String),
    /// The graceful exit signal.
    EndOfLog,
    /// Park forever (lets tests keep a sender alive until shutdown).
    Block,
}

/// In-memory `BinlogManager` serving a shared step script and recording
/// every `open_reader` call. Readers opened after a reset continue the same
/// script where the failure left off.
pub struct ScriptedBinlog {
    steps: Arc<Mutex<VecDeque<ReadStep>>>,
    opens: Mutex<Vec<(u64, u64)>>,
    fail_open: AtomicBool,
}

impl ScriptedBinlog {
    pub fn new(steps: Vec<ReadStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Arc::new(Mutex::new(steps.into())),
            opens: Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
        })
    }

    /// Make every subsequent `open_reader` fail.
    pub fn fail_opens(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    /// Every `(file_number, byte_offset)` `open_reader` was called with.
    pub fn opens(&self) -> Vec<(u64, u64)> {
        self.opens.lock().unwrap().clone()
    }
}

impl BinlogManager for ScriptedBinlog {
    fn open_reader(
        &self,
        file_number: u64,
        byte_offset: u64,
    ) -> BoxFuture<'_, Box<dyn BinlogReader>> {
        Box::pin(async move {
            self.opens.lock().unwrap().push((file_number, byte_offset));
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(RelayError::LogOpen {
                    file_number,
                    message: "scripted open failure".to_string(),
                });
            }
            Ok(Box::new(ScriptedReader {
                steps: Arc::clone(&self.steps),
                position: Mutex::new((file_number, byte_offset)),
            }) as Box<dyn BinlogReader>)
        })
    }
}

struct ScriptedReader {
    steps: Arc<Mutex<VecDeque<ReadStep>>>,
    position: Mutex<(u64, u64)>,
}

impl BinlogReader for ScriptedReader {
    fn read_batch(&mut self) -> BoxFuture<'_, ReadBatch> {
        Box::pin(async move {
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(ReadStep::Batch(records, position)) => {
                    *self.position.lock().unwrap() = position;
                    Ok(ReadBatch::Records(records))
                }
                Some(ReadStep::Error(message)) => Err(RelayError::LogRead(message)),
                Some(ReadStep::EndOfLog) | None => Ok(ReadBatch::EndOfLog),
                Some(ReadStep::Block) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        })
    }

    fn current_offset(&self) -> (u64, u64) {
        *self.position.lock().unwrap()
    }
}

/// Convenience record constructor.
pub fn record(
    origin: i32,
    file_number: u64,
    key: &str,
    value: &[u8],
    op: RecordOp,
    exec_time: i64,
) -> ChangeLogRecord {
    ChangeLogRecord {
        origin_server_id: origin,
        file_number,
        key: key.to_string(),
        value: value.to_vec(),
        op,
        exec_time,
    }
}

// =============================================================================
// Scripted transport
// =============================================================================

/// Behavior of one `connect()` call on a [`ScriptedConnector`].
pub enum LinkBehavior {
    /// Connect fails.
    Refuse,
    /// Connect succeeds but every send fails.
    SendsFail,
    /// Connect succeeds; sent bytes are recorded and `recv_reply` serves the
    /// given replies in order.
    Accept(Vec<Reply>),
}

/// `Connector` that serves scripted behaviors per connect call (falling back
/// to `Accept([+OK])` when the script runs dry) and records all traffic.
pub struct ScriptedConnector {
    behaviors: Mutex<VecDeque<LinkBehavior>>,
    sent: Arc<Mutex<Vec<u8>>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(behaviors: Vec<LinkBehavior>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(behaviors.into()),
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// All bytes sent over accepted links, in order.
    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        server_id: i32,
        _ip: &str,
        _port: u16,
        _timeouts: LinkTimeouts,
    ) -> BoxFuture<'_, Box<dyn Link>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| LinkBehavior::Accept(vec![Reply::Simple("OK".to_string())]));
            match behavior {
                LinkBehavior::Refuse => Err(RelayError::connection(
                    server_id,
                    "scripted connection refusal",
                )),
                LinkBehavior::SendsFail => Ok(Box::new(ScriptedLink {
                    server_id,
                    sent: None,
                    replies: VecDeque::new(),
                }) as Box<dyn Link>),
                LinkBehavior::Accept(replies) => Ok(Box::new(ScriptedLink {
                    server_id,
                    sent: Some(Arc::clone(&self.sent)),
                    replies: replies.into(),
                }) as Box<dyn Link>),
            }
        })
    }
}

struct ScriptedLink {
    server_id: i32,
    /// `None` means the link fails every send.
    sent: Option<Arc<Mutex<Vec<u8>>>>,
    replies: VecDeque<Reply>,
}

impl Link for ScriptedLink {
    fn send_all<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match &self.sent {
                Some(sink) => {
                    sink.lock().unwrap().extend_from_slice(bytes);
                    Ok(())
                }
                None => Err(RelayError::connection(
                    self.server_id,
                    "scripted send failure",
                )),
            }
        })
    }

    fn recv_reply(&mut self) -> BoxFuture<'_, Reply> {
        Box::pin(async move {
            self.replies.pop_front().ok_or_else(|| {
                RelayError::connection(self.server_id, "scripted link out of replies")
            })
        })
    }

    fn descriptor(&self) -> i32 {
        99
    }
}

// =============================================================================
// Real localhost endpoints
// =============================================================================

/// A listener that accepts connections forever, appending everything read to
/// a shared buffer. Used as a peer's data channel.
pub struct CaptureEndpoint {
    pub port: u16,
    received: Arc<Mutex<Vec<u8>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl CaptureEndpoint {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::over(listener)
    }

    pub fn over(listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let mut chunk = [0u8; 4096];
                    while let Ok(n) = sock.read(&mut chunk).await {
                        if n == 0 {
                            return;
                        }
                        sink.lock().unwrap().extend_from_slice(&chunk[..n]);
                    }
                });
            }
        });
        Self {
            port,
            received,
            handle,
        }
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// Poll until the captured bytes contain `needle` or the deadline passes.
    pub async fn wait_for(&self, needle: &[u8], timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .received()
                .windows(needle.len().max(1))
                .any(|w| w == needle)
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl Drop for CaptureEndpoint {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A listener that answers every connection with a fixed reply after reading
/// one request. Used as a peer's control endpoint.
pub struct ControlEndpoint {
    pub port: u16,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ControlEndpoint {
    pub async fn spawn(reply: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::over(listener, reply)
    }

    pub fn over(listener: TcpListener, reply: &'static [u8]) -> Self {
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut chunk = [0u8; 4096];
                    if let Ok(n) = sock.read(&mut chunk).await {
                        log.lock().unwrap().push(chunk[..n].to_vec());
                    }
                    let _ = sock.write_all(reply).await;
                });
            }
        });
        Self {
            port,
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for ControlEndpoint {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Bind a control listener and a data listener exactly `offset` ports above
/// it, retrying until a free pair is found.
pub async fn bind_port_pair(offset: u16) -> (TcpListener, TcpListener) {
    for _ in 0..50 {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = control.local_addr().unwrap().port();
        let Some(data_port) = control_port.checked_add(offset) else {
            continue;
        };
        if let Ok(data) = TcpListener::bind(("127.0.0.1", data_port)).await {
            return (control, data);
        }
    }
    panic!("could not find a free control/data port pair");
}
