use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;

/// Outbound RPC timeout used for conductor reports and peer batches.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(90);

/// Fire-and-forget delivery of JSON bodies to peer workers and the
/// conductor. `deliver` returns once the request is submitted; delivery
/// reliability is the transport's concern, completion and failure never
/// propagate back into worker state.
pub trait Transport: Send + Sync {
    fn deliver(&self, base_url: &str, path: &str, body: Value);
}

struct Dispatch {
    url: String,
    body: Value,
}

/// HTTP transport backed by a dedicated dispatcher thread. Callers enqueue
/// onto a channel; the dispatcher posts each body with a fixed timeout and
/// drops failures after logging them.
pub struct HttpTransport {
    sender: Sender<Dispatch>,
    _dispatcher: Option<thread::JoinHandle<()>>,
}

impl HttpTransport {
    pub fn spawn() -> Result<Self> {
        Self::with_timeout(RPC_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Dispatch>();
        let dispatcher = thread::Builder::new()
            .name("pregel-transport".into())
            .spawn(move || {
                let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
                    Ok(client) => client,
                    Err(err) => {
                        warn!(%err, "transport.client.build_failed");
                        return;
                    }
                };
                while let Ok(dispatch) = receiver.recv() {
                    match client.post(&dispatch.url).json(&dispatch.body).send() {
                        Ok(response) => {
                            debug!(url = %dispatch.url, status = %response.status(), "transport.post.sent");
                        }
                        Err(err) => {
                            warn!(url = %dispatch.url, %err, "transport.post.failed");
                        }
                    }
                }
            })?;
        Ok(Self {
            sender,
            _dispatcher: Some(dispatcher),
        })
    }
}

impl Transport for HttpTransport {
    fn deliver(&self, base_url: &str, path: &str, body: Value) {
        let url = join_url(base_url, path);
        if self.sender.send(Dispatch { url, body }).is_err() {
            warn!("transport.dispatcher.gone");
        }
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
