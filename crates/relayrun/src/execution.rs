//! # Execution Callback
//!
//! The handle a method handler uses to report progress and observe
//! cancellation. Executions form a tree: a sub-execution stands for
//! `proportion` steps of its parent and converts its own progress into
//! parent steps as it goes.
//!
//! ## Invariants
//!
//! - A child contributes `proportion * worked / total` parent steps, computed
//!   in integers. A finished child contributes at least `proportion`.
//! - Contributions only grow. Each update hands the parent the difference
//!   between the new contribution and what was already handed over.
//! - A batched child contributes nothing until it is complete, then its
//!   whole share at once.
//! - At most one node lock is held at a time. Updates walk child to parent,
//!   snapshots walk parent to child.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use relayrpc::Progress;
use relayrpc::TaskId;
use tokio_util::sync::CancellationToken;

/// Returned by `check_canceled` once the invocation was canceled.
///
/// Handlers propagate it with `?`; the server recognizes it and reports a
/// cancel instead of an application error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invocation canceled")
    }
}

impl std::error::Error for Canceled {}

/// Progress and cancel handle for one node of an execution tree.
#[derive(Clone)]
pub struct ExecutionCallback {
    node: Arc<Node>,
    token: CancellationToken,
}

struct Node {
    task_id: TaskId,
    proportion: u64,
    batched: bool,
    parent: Option<Weak<Node>>,
    dirty: Arc<AtomicBool>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    total_step_count: u64,
    total_worked: u64,
    description: Option<String>,
    finished: bool,
    /// Parent steps already handed to the parent.
    reported: u64,
    children: Vec<Arc<Node>>,
}

impl Node {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parent steps this node is worth right now.
    fn share(&self, state: &State) -> u64 {
        let total = state.total_step_count;
        let complete = state.finished || (total > 0 && state.total_worked >= total);
        if self.batched && !complete {
            return 0;
        }

        let scaled = if total == 0 {
            0
        } else {
            let exact = self.proportion as u128 * state.total_worked as u128 / total as u128;
            u64::try_from(exact).unwrap_or(u64::MAX)
        };

        if state.finished {
            scaled.max(self.proportion)
        } else {
            scaled
        }
    }

    /// Applies `change` and pushes any new contribution up the tree.
    fn update(&self, change: impl FnOnce(&mut State)) {
        let mut delta = {
            let mut state = self.lock();
            change(&mut state);
            self.settle(&mut state)
        };
        self.dirty.store(true, Ordering::Release);

        let mut parent = self.parent.as_ref().and_then(Weak::upgrade);
        while let Some(node) = parent {
            if delta == 0 {
                break;
            }
            delta = {
                let mut state = node.lock();
                state.total_worked = state.total_worked.saturating_add(delta);
                node.settle(&mut state)
            };
            parent = node.parent.as_ref().and_then(Weak::upgrade);
        }
    }

    /// Records the current share as reported and returns what is new.
    fn settle(&self, state: &mut State) -> u64 {
        if self.parent.is_none() {
            return 0;
        }
        let share = self.share(state);
        let delta = share.saturating_sub(state.reported);
        state.reported = state.reported.max(share);
        delta
    }

    fn snapshot(&self) -> Progress {
        let (mut progress, children) = {
            let state = self.lock();
            let progress = Progress {
                task_id: self.task_id,
                step_proportion: match self.parent {
                    Some(_) => self.proportion,
                    None => state.total_step_count,
                },
                total_step_count: state.total_step_count,
                total_worked: state.total_worked,
                description: state.description.clone(),
                finished: state.finished,
                sub_progress: Vec::new(),
            };
            (progress, state.children.clone())
        };

        progress.sub_progress = children.iter().map(|child| child.snapshot()).collect();
        progress
    }
}

impl ExecutionCallback {
    /// A root execution canceled through `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            node: Arc::new(Node {
                task_id: TaskId::random(),
                proportion: 0,
                batched: false,
                parent: None,
                dirty: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(State::default()),
            }),
            token,
        }
    }

    /// A root execution nobody can cancel. Useful outside a server.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn task_id(&self) -> TaskId {
        self.node.task_id
    }

    pub fn set_total_step_count(&self, total: u64) {
        self.node.update(|state| state.total_step_count = total);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        let description = description.into();
        self.node.update(|state| state.description = Some(description));
    }

    pub fn worked_one(&self) {
        self.worked(1);
    }

    /// Adds `steps` to the worked count. Overshooting the total is allowed.
    pub fn worked(&self, steps: u64) {
        self.node
            .update(|state| state.total_worked = state.total_worked.saturating_add(steps));
    }

    /// Marks this execution complete. A sub-execution hands over at least
    /// its full proportion.
    pub fn finished(&self) {
        self.node.update(|state| state.finished = true);
    }

    /// Creates a child that stands for `proportion` of this execution's
    /// steps. A `batched` child reports nothing until it completes.
    pub fn create_sub_execution(&self, proportion: u64, batched: bool) -> ExecutionCallback {
        let child = Arc::new(Node {
            task_id: TaskId::random(),
            proportion,
            batched,
            parent: Some(Arc::downgrade(&self.node)),
            dirty: Arc::clone(&self.node.dirty),
            state: Mutex::new(State::default()),
        });
        self.node.lock().children.push(Arc::clone(&child));
        self.node.dirty.store(true, Ordering::Release);

        ExecutionCallback {
            node: child,
            token: self.token.clone(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Canceled)` once the invocation was canceled.
    pub fn check_canceled(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the invocation is canceled.
    pub async fn canceled(&self) {
        self.token.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Snapshot of this node and everything below it.
    pub fn progress(&self) -> Progress {
        self.node.snapshot()
    }

    /// Clears and returns the tree's changed flag.
    pub(crate) fn take_dirty(&self) -> bool {
        self.node.dirty.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for ExecutionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCallback")
            .field("task_id", &self.node.task_id)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
