pub mod aggregators;
pub mod algos;
pub mod cache;
pub mod context;
pub mod error;
pub mod graph;
pub mod message;
pub mod protocol;
pub mod state;
pub mod stats;
pub mod transport;
pub mod worker;

pub use crate::algos::{create_worker, Algorithm, ComputeContext, VertexComputation};
pub use crate::error::{PregelError, Result};
pub use crate::graph::{GraphBuilder, GraphStore};
pub use crate::protocol::{GraphSource, WorkerConfig};
pub use crate::state::{ShardLocation, ShardMap};
pub use crate::transport::{HttpTransport, Transport};
pub use crate::worker::{PregelWorker, Worker};
