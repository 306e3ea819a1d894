//! Memoized async tasks with dependency tracking and cycle detection.
//! See [`TaskTracker`] for more details.

use super::thunk::Thunk;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::Arc,
};
use tokio::sync::Mutex;

/// The work performed for each task of a [`TaskTracker`].
///
/// `work` receives a [`TaskContext`] through which it can `require` other
/// tasks. Each key's work runs at most once; every caller shares its output.
#[async_trait::async_trait]
pub trait TaskWork {
    type Output: Send + Sync;
    type Key: Clone + Ord + std::fmt::Display + Send;
    type CycleError;

    /// Perform the work for the task indicated by `key`.
    async fn work(&self, context: TaskContext<Self>, key: Self::Key) -> Self::Output;

    /// Convert a [`Cycle`] into an error type of your choice.
    fn cycle_error(&self, cycle: Cycle<Self::Key>) -> Self::CycleError;
}

struct TaskState<Work: TaskWork + ?Sized> {
    result: Thunk<Work::Output>,
    dependencies: Vec<Work::Key>,
}

struct InnerState<Work: TaskWork + ?Sized> {
    tasks: BTreeMap<Work::Key, TaskState<Work>>,
    work_context: Arc<Work>,
}

/// Task scheduling with memoization and cycle detection.
///
/// Tasks that do not depend on each other run concurrently once spawned;
/// a task that `require`s another waits for that one's output.
pub struct TaskTracker<Work: TaskWork + ?Sized> {
    state: Arc<Mutex<InnerState<Work>>>,
}
impl<Work: TaskWork + Send + Sync + 'static> TaskTracker<Work>
where
    Work::Output: Clone + Send + Sync,
    Work::Key: Clone + Send + Sync,
{
    pub fn new(work_context: Arc<Work>) -> Self {
        TaskTracker {
            state: Arc::new(Mutex::new(InnerState {
                tasks: BTreeMap::new(),
                work_context,
            })),
        }
    }

    /// Look up or create the task for `key`, without starting it.
    pub async fn create(&self, key: Work::Key) -> Thunk<Work::Output> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get(&key) {
            return task.result.clone();
        }
        let result = {
            let context = TaskContext {
                tracker: self.clone(),
                key: key.clone(),
            };
            let closure = state.work_context.clone();
            let key2 = key.clone();
            Thunk::new(async move { closure.work(context, key2).await })
        };
        state.tasks.insert(
            key,
            TaskState {
                result: result.clone(),
                dependencies: Vec::new(),
            },
        );
        result
    }

    /// Start the task for `key` on the runtime and return a handle to its output.
    pub async fn spawn(&self, key: Work::Key) -> Thunk<Work::Output> {
        let thunk = self.create(key).await;
        let thunk_for_thread = thunk.clone();
        tokio::spawn(async move {
            thunk_for_thread.force().await;
        });
        thunk
    }

    /// Run the task for the given key and wait for it to complete.
    pub async fn run(&self, key: Work::Key) -> Work::Output {
        let thunk = self.create(key).await;
        thunk.force().await.clone()
    }
}

impl<Work> Clone for TaskTracker<Work>
where
    Work: TaskWork + ?Sized,
{
    fn clone(&self) -> Self {
        TaskTracker {
            state: self.state.clone(),
        }
    }
}

/// Handed to [`TaskWork::work`]; records the dependencies of the current task.
pub struct TaskContext<Work: TaskWork + ?Sized> {
    tracker: TaskTracker<Work>,
    key: Work::Key,
}
impl<Work: TaskWork + ?Sized> Clone for TaskContext<Work> {
    fn clone(&self) -> Self {
        TaskContext {
            tracker: self.tracker.clone(),
            key: self.key.clone(),
        }
    }
}
impl<Work: TaskWork + Send + Sync + 'static> TaskContext<Work>
where
    Work::Output: Clone + Send + Sync,
    Work::Key: Clone + Send + Sync,
{
    async fn add_dependency(&self, key: Work::Key) -> Result<(), Work::CycleError> {
        let mut state = self.tracker.state.lock().await;

        let known = match state.tasks.get(&self.key) {
            Some(task) => task.dependencies.contains(&key),
            None => false,
        };
        if known {
            return Ok(());
        }

        if let Some(mut path) = find_path_to(
            &mut BTreeSet::new(),
            &state.tasks,
            &self.key,
            std::slice::from_ref(&key),
        ) {
            path.reverse();
            return Err(state.work_context.cycle_error(Cycle { path }));
        }

        if let Some(task) = state.tasks.get_mut(&self.key) {
            task.dependencies.push(key);
        }
        Ok(())
    }

    /// Wait for the output of `key`, recording it as a dependency of this task.
    #[allow(clippy::type_complexity)]
    pub fn require(
        &self,
        key: Work::Key,
    ) -> Pin<Box<dyn Future<Output = Result<Work::Output, Work::CycleError>> + Send + '_>>
    where
        Work: 'static,
    {
        Box::pin(async move {
            self.add_dependency(key.clone()).await?;
            Ok(self.tracker.run(key).await)
        })
    }
}

// Depth-first search over the recorded dependencies. Resource graphs are small
// and already checked for cycles before scheduling, so this stays naive.
fn find_path_to<Work: TaskWork + ?Sized>(
    seen: &mut BTreeSet<Work::Key>,
    tasks: &BTreeMap<Work::Key, TaskState<Work>>,
    needle: &Work::Key,
    outgoing: &[Work::Key],
) -> Option<Vec<Work::Key>> {
    if outgoing.contains(needle) {
        return Some(vec![needle.clone()]);
    }
    for edge in outgoing {
        if !seen.insert(edge.clone()) {
            continue;
        }
        if let Some(node) = tasks.get(edge) {
            if let Some(mut path) = find_path_to(seen, tasks, needle, node.dependencies.as_slice())
            {
                path.push(edge.clone());
                return Some(path);
            }
        }
    }
    None
}

/// A cycle in the task graph. The first element depends on the second, and so
/// forth; the last depends on the first, which is not repeated in `path()`.
#[derive(Clone, Debug)]
pub struct Cycle<Key> {
    path: Vec<Key>,
}
impl<Key> Cycle<Key> {
    pub fn path(&self) -> &[Key] {
        &self.path
    }

    pub fn into_path(self) -> Vec<Key> {
        self.path
    }
}
impl<Key: std::fmt::Display> std::fmt::Display for Cycle<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for k in &self.path {
            write!(f, "{} -> ", k)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}
