//! In-process signalling server for tests.
//!
//! Accepts WebSocket connections on `127.0.0.1:<random>`, records every text frame the
//! client sends, and lets the test push frames or drop the current connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

enum Command {
    Send(String),
    Drop,
}

pub struct MockSignallingServer {
    addr: std::net::SocketAddr,
    frames: mpsc::UnboundedReceiver<String>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl MockSignallingServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn({
            let current = Arc::clone(&current);
            let connections = Arc::clone(&connections);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(ws) = accept_async(stream).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    *current.lock().await = Some(cmd_tx);
                    tokio::spawn(serve(ws, cmd_rx, frames_tx.clone()));
                }
            }
        });

        Ok(Self {
            addr,
            frames,
            current,
            connections,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of WebSocket handshakes accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait (up to a few seconds) until at least `n` connections were accepted.
    pub async fn wait_for_connections(&self, n: usize) -> usize {
        let _ = timeout(Duration::from_secs(5), async {
            while self.connections() < n {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        self.connections()
    }

    /// Push a text frame to the most recent connection.
    pub async fn send(&self, text: &str) {
        if let Some(tx) = self.current.lock().await.as_ref() {
            let _ = tx.send(Command::Send(text.to_owned()));
        }
    }

    /// Close the most recent connection from the server side.
    pub async fn drop_connection(&self) {
        if let Some(tx) = self.current.lock().await.take() {
            let _ = tx.send(Command::Drop);
        }
    }

    /// Next text frame sent by any client, or `None` after a few seconds of silence.
    pub async fn next_frame(&mut self) -> Option<String> {
        timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for MockSignallingServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::UnboundedSender<String>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Drop) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = frames.send(text.as_str().to_owned());
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
