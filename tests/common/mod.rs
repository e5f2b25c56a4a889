#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use pregel::protocol::{PrepareGssRequest, StartGssRequest};
use pregel::{PregelWorker, Transport};

/// One captured outbound RPC.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub base_url: String,
    pub path: String,
    pub body: Value,
}

/// Transport double that hands every delivery to the test over a channel.
pub struct ChannelTransport {
    sender: Mutex<Sender<Delivery>>,
}

impl Transport for ChannelTransport {
    fn deliver(&self, base_url: &str, path: &str, body: Value) {
        let _ = self.sender.lock().send(Delivery {
            base_url: base_url.to_owned(),
            path: path.to_owned(),
            body,
        });
    }
}

pub fn channel_transport() -> (Arc<ChannelTransport>, Receiver<Delivery>) {
    let (sender, receiver) = channel();
    (
        Arc::new(ChannelTransport {
            sender: Mutex::new(sender),
        }),
        receiver,
    )
}

/// Blocks until the worker posts its completion report for the running
/// superstep. Peer message deliveries arriving first are returned too.
pub fn wait_for_report(receiver: &Receiver<Delivery>) -> Value {
    let deadline = Duration::from_secs(10);
    loop {
        let delivery = receiver
            .recv_timeout(deadline)
            .expect("completion report within the deadline");
        if delivery.path.ends_with("finishedGSS") {
            return delivery.body;
        }
    }
}

/// Plays the conductor for one superstep: prepare, start, then wait for
/// the barrier's report. `aggregators` mirrors the previous report's
/// values back, the way the real conductor does.
pub fn run_superstep(
    worker: &dyn PregelWorker,
    receiver: &Receiver<Delivery>,
    gss: u64,
    aggregators: Option<Map<String, Value>>,
) -> Value {
    worker
        .prepare_global_step(PrepareGssRequest {
            gss,
            aggregator_values: aggregators,
        })
        .expect("prepare accepted");
    worker
        .start_global_step(StartGssRequest { gss })
        .expect("start accepted");
    wait_for_report(receiver)
}

/// The `aggregatorValues` object of a report, if any.
pub fn report_aggregators(report: &Value) -> Option<Map<String, Value>> {
    report
        .get("aggregatorValues")
        .and_then(Value::as_object)
        .cloned()
}
