use crate::aggregators::AggregatorRegistry;

/// Global figures seeded from the init config, visible to worker contexts
/// and vertex programs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextState {
    pub total_vertex_count: u64,
    pub total_edge_count: u64,
}

/// Per-worker algorithm hooks around the superstep cycle.
///
/// `pre_application` runs once at worker construction,
/// `pre_global_superstep` inside `prepare_global_step`, and
/// `post_global_superstep` after the barrier, before the completion report
/// leaves. The post hook may fold additional values into the worker
/// aggregators that are about to be reported.
pub trait WorkerContext: Send {
    fn pre_application(&mut self, _state: &ContextState) {}

    fn pre_global_superstep(&mut self, _gss: u64, _conductor: &AggregatorRegistry) {}

    fn post_global_superstep(&mut self, _gss: u64, _worker: &mut AggregatorRegistry) {}
}
