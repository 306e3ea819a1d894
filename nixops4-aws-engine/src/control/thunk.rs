//! Module for deferred computations, [`Thunk`].
use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};
use tokio::sync::{Mutex, OnceCell};

/// A future that runs at most once and remembers its result.
///
/// Every clone shares the same result, so several resources waiting on one
/// dependency all observe a single convergence of it.
pub struct Thunk<T> {
    thunk_state: Arc<ThunkState<T>>,
}
impl<T> Thunk<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static + Send,
    {
        Thunk {
            thunk_state: Arc::new(ThunkState::new(future)),
        }
    }

    /// Force the thunk. The inner future is polled to completion only on the first call.
    /// Subsequent calls return the cached value.
    pub async fn force(&self) -> &T {
        self.thunk_state.force().await
    }

    /// Force every thunk in `map` and collect the results.
    pub async fn force_into_map<Key: Ord>(map: BTreeMap<Key, Thunk<T>>) -> BTreeMap<Key, T>
    where
        T: Clone,
    {
        let mut result_map: BTreeMap<Key, T> = BTreeMap::new();
        for (id, thunk) in map {
            result_map.insert(id, thunk.force().await.clone());
        }
        result_map
    }
}
impl<T> Clone for Thunk<T> {
    fn clone(&self) -> Self {
        Thunk {
            thunk_state: self.thunk_state.clone(),
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

struct ThunkState<T> {
    cell: OnceCell<T>,
    /// Taken by whichever caller ends up initializing `cell`.
    future: Mutex<Option<BoxFuture<T>>>,
}
impl<T> ThunkState<T> {
    fn new<F>(future: F) -> ThunkState<T>
    where
        F: Future<Output = T> + 'static + Send,
    {
        ThunkState {
            cell: OnceCell::new(),
            future: Mutex::new(Some(Box::pin(future))),
        }
    }
    async fn force(self: &Arc<Self>) -> &T {
        self.cell
            .get_or_init(|| async {
                let mut future = self.future.lock().await;
                match future.take() {
                    Some(future) => future.await,
                    // OnceCell runs at most one initializer to completion
                    None => unreachable!("Thunk future taken without initializing the cell"),
                }
            })
            .await
    }
}
