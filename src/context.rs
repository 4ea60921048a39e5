//! Per-thread call graphs and the process-wide registry.
//!
//! Each instrumented thread owns a [`ThreadContext`]: a stack of open
//! scopes plus the accumulated (parent, child) edge graph. The
//! [`ProcessContext`] holds one record per thread that ever entered a
//! scope; records outlive their threads so a dump sees completed work.
//!
//! Lock order is strictly one at a time: the registry lock is released
//! before any per-thread lock is taken, and the metadata provider's
//! internal lock is only ever taken while holding at most a per-thread
//! lock.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::counter::{Counter, EdgeCounter};
use crate::hook::{self, HookDisableGuard};
use crate::info::{self, ProcessInfoSource, ThreadInfoSource};
use crate::location::ScopeNode;

/// Accumulated caller → callee edges for one thread. Ordered so that dump
/// output is deterministic for a given set of nodes.
pub type ScopeGraph = BTreeMap<ScopeNode, BTreeMap<ScopeNode, EdgeCounter>>;

struct Inner {
    graph: ScopeGraph,
    /// Open scopes, outermost first. Index 0 is always the synthetic root.
    stack: Vec<ScopeNode>,
    /// Heap totals captured at this thread's last enter/exit. The hot-path
    /// byte counters live in thread-local storage and cannot be read from
    /// a dumping thread, so in-flight refreshes reuse this snapshot.
    last_heap: (u64, u64),
}

pub struct ThreadContext {
    info: Box<dyn ThreadInfoSource>,
    inner: Mutex<Inner>,
}

impl ThreadContext {
    pub(crate) fn for_current_thread() -> Self {
        Self::with_info(info::current_thread_info())
    }

    pub fn with_info(info: Box<dyn ThreadInfoSource>) -> Self {
        Self {
            info,
            inner: Mutex::new(Inner {
                graph: ScopeGraph::new(),
                stack: vec![ScopeNode::root()],
                last_heap: (0, 0),
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> &dyn ThreadInfoSource {
        self.info.as_ref()
    }

    /// Open `node` under the innermost open scope.
    pub fn enter(&self, node: ScopeNode) {
        let heap = hook::thread_totals();
        // The graph insertions below allocate; keep those bytes out of the
        // totals being measured.
        let _quiet = HookDisableGuard::new();
        let mut inner = self.lock_inner();
        inner.last_heap = heap;
        let now = Counter::now(self.info.as_ref(), heap);
        let parent = inner.stack.last().copied().unwrap_or_else(ScopeNode::root);
        inner
            .graph
            .entry(parent)
            .or_default()
            .entry(node)
            .or_default()
            .start(now);
        inner.stack.push(node);
    }

    /// Close the innermost open scope. An exit with no matching enter is
    /// logged and ignored.
    pub fn exit(&self) {
        let heap = hook::thread_totals();
        let _quiet = HookDisableGuard::new();
        let mut inner = self.lock_inner();
        if inner.stack.len() <= 1 {
            debug_assert!(false, "scope exit without a matching enter");
            log::warn!("scope exit without a matching enter; ignoring");
            return;
        }
        inner.last_heap = heap;
        let now = Counter::now(self.info.as_ref(), heap);
        let node = match inner.stack.pop() {
            Some(node) => node,
            None => return,
        };
        let parent = inner.stack.last().copied().unwrap_or_else(ScopeNode::root);
        if let Some(edge) = inner
            .graph
            .get_mut(&parent)
            .and_then(|children| children.get_mut(&node))
        {
            edge.stop(now);
        }
    }

    /// Fold the elapsed portion of every open edge into its total and
    /// restart its snapshot, so a dump taken mid-scope reports work done
    /// so far. Safe to call from any thread.
    pub fn update_in_flight(&self) {
        let _quiet = HookDisableGuard::new();
        let mut inner = self.lock_inner();
        let heap = inner.last_heap;
        let now = Counter::now(self.info.as_ref(), heap);
        for children in inner.graph.values_mut() {
            for edge in children.values_mut() {
                edge.update(now);
            }
        }
    }

    /// Number of currently open scopes on this thread's stack.
    pub fn scope_depth(&self) -> usize {
        self.lock_inner().stack.len() - 1
    }

    pub fn graph(&self) -> ScopeGraph {
        self.lock_inner().graph.clone()
    }

    fn finish(&self) {
        self.info.finalize();
    }
}

static INSTALLED: OnceLock<ProcessContext> = OnceLock::new();

struct ThreadHandle {
    context: Arc<ThreadContext>,
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.context.finish();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// Registry of every thread that has entered a scope, plus the process
/// metadata provider. One instance is installed for the process lifetime.
pub struct ProcessContext {
    threads: Mutex<Vec<Arc<ThreadContext>>>,
    process_info: Box<dyn ProcessInfoSource>,
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessContext {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            process_info: info::process_info(),
        }
    }

    /// Install this context as the process singleton. First installation
    /// wins; a repeat is logged and the existing context is returned.
    pub fn install(self) -> &'static ProcessContext {
        let mut fresh = false;
        let context = INSTALLED.get_or_init(|| {
            fresh = true;
            self
        });
        if !fresh {
            log::warn!("process context already installed; keeping the existing one");
        }
        context
    }

    pub fn installed() -> Option<&'static ProcessContext> {
        INSTALLED.get()
    }

    pub fn process_info(&self) -> &dyn ProcessInfoSource {
        self.process_info.as_ref()
    }

    /// Snapshot of all registered thread records, past and present.
    pub fn threads(&self) -> Vec<Arc<ThreadContext>> {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The calling thread's context, registering it on first use. Returns
    /// `None` only during thread teardown, once thread-local storage is
    /// gone.
    pub fn current_thread_context(&'static self) -> Option<Arc<ThreadContext>> {
        CURRENT
            .try_with(|slot| {
                let mut slot = slot.borrow_mut();
                if let Some(handle) = slot.as_ref() {
                    return Arc::clone(&handle.context);
                }
                let context = self.register_current_thread();
                *slot = Some(ThreadHandle {
                    context: Arc::clone(&context),
                });
                context
            })
            .ok()
    }

    fn register_current_thread(&self) -> Arc<ThreadContext> {
        let _quiet = HookDisableGuard::new();
        let context = Arc::new(ThreadContext::for_current_thread());
        log::debug!("registering thread {}", context.info().thread_id());
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&context));
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Metric;
    use crate::info::NullThreadInfo;
    use crate::location::Location;

    fn node(tag: &'static str) -> ScopeNode {
        ScopeNode::new(tag, Location::new("context_tests.rs", 1, 1))
    }

    fn test_context() -> ThreadContext {
        ThreadContext::with_info(Box::new(NullThreadInfo::for_current_thread()))
    }

    #[test]
    fn enter_exit_builds_edges_under_root() {
        let ctx = test_context();
        ctx.enter(node("outer"));
        ctx.enter(node("inner"));
        assert_eq!(ctx.scope_depth(), 2);
        ctx.exit();
        ctx.exit();
        assert_eq!(ctx.scope_depth(), 0);

        let graph = ctx.graph();
        let root_children = graph.get(&ScopeNode::root()).unwrap();
        assert!(root_children.contains_key(&node("outer")));
        let outer_children = graph.get(&node("outer")).unwrap();
        assert!(outer_children.contains_key(&node("inner")));
        assert!(outer_children[&node("inner")].is_completed());
    }

    #[test]
    fn repeated_scope_reuses_one_edge() {
        let ctx = test_context();
        for _ in 0..3 {
            ctx.enter(node("work"));
            ctx.exit();
        }
        let graph = ctx.graph();
        let root_children = graph.get(&ScopeNode::root()).unwrap();
        assert_eq!(root_children.len(), 1);
    }

    #[test]
    fn unbalanced_exit_is_ignored() {
        let ctx = test_context();
        ctx.enter(node("only"));
        ctx.exit();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ctx.exit()));
        // Release builds ignore the extra exit; debug builds assert.
        if result.is_ok() {
            assert_eq!(ctx.scope_depth(), 0);
            ctx.enter(node("after"));
            assert_eq!(ctx.scope_depth(), 1);
            ctx.exit();
        }
    }

    #[test]
    fn update_in_flight_accumulates_open_edges() {
        let ctx = test_context();
        ctx.enter(node("open"));
        ctx.update_in_flight();
        let graph = ctx.graph();
        let edge = &graph[&ScopeNode::root()][&node("open")];
        assert!(!edge.is_completed());
        // Wall clock only advances between the enter snapshot and the
        // refresh; the fold must not lose the open instance.
        let folded = edge.total().value(Metric::WallClock);
        ctx.exit();
        let graph = ctx.graph();
        let edge = &graph[&ScopeNode::root()][&node("open")];
        assert!(edge.is_completed());
        assert!(edge.total().value(Metric::WallClock) >= folded);
    }

    #[test]
    fn cross_thread_graph_read_sees_committed_work() {
        let ctx = Arc::new(test_context());
        let worker = Arc::clone(&ctx);
        std::thread::spawn(move || {
            worker.enter(node("threaded"));
            worker.exit();
        })
        .join()
        .unwrap();
        let graph = ctx.graph();
        assert!(graph[&ScopeNode::root()][&node("threaded")].is_completed());
    }
}
