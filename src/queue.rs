// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{Pool, Runtime};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::deferred::{DeferredEngine, RecurringEngine};
use crate::error::{Error, Result};
use crate::id::{IdGenerator, UuidGenerator};
use crate::list::{self, List};
use crate::marshal::{JsonMarshaller, Marshaller};
use crate::stats;
use crate::store::PayloadStore;
use crate::task::{ensure_identifier, MapTask, Task};
use crate::timestamp::Timestamp;

/// How to reach the backing store.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub redis_url: String,
    pub pool_size: usize,
}

impl ConnectionConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            pool_size: 16,
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    fn build_pool(&self) -> Result<Pool> {
        let mut cfg = deadpool_redis::Config::from_url(self.redis_url.clone());
        cfg.pool = Some(deadpool_redis::PoolConfig::new(self.pool_size));
        cfg.create_pool(Some(Runtime::Tokio1))
            .map_err(|_| Error::Misconfiguration("invalid redis connection configuration"))
    }
}

/// Queue behavior that is independent of any particular Redis deployment:
/// key naming, and which of the optional paths (`done` queue, retaining
/// finished payloads, deferred scheduling) are switched on.
#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: String,
    pub id_field: String,
    pub delim: String,
    pub use_done_queue: bool,
    pub keep_done_tasks: bool,
    pub allow_defer: bool,
}

impl Config {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            id_field: "id".to_string(),
            delim: ":".to_string(),
            use_done_queue: false,
            keep_done_tasks: false,
            allow_defer: false,
        }
    }

    pub fn id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn delim(mut self, delim: impl Into<String>) -> Self {
        self.delim = delim.into();
        self
    }

    pub fn use_done_queue(mut self, v: bool) -> Self {
        self.use_done_queue = v;
        self
    }

    pub fn keep_done_tasks(mut self, v: bool) -> Self {
        self.keep_done_tasks = v;
        self
    }

    pub fn allow_defer(mut self, v: bool) -> Self {
        self.allow_defer = v;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(Error::Misconfiguration("Config::prefix must not be empty"));
        }
        Ok(())
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}{}", self.prefix, self.delim, suffix)
    }
}

/// The four reference lists, the payload store, and the scheduling sets,
/// bundled as one cheaply-`Clone`able handle. Split out from
/// [`ReliableQueue`] so the background `finish`/`fail` handlers spawned by
/// [`ReliableQueue::listen`] can own a copy without borrowing the queue.
#[derive(Clone)]
struct Core<M> {
    config: Arc<Config>,
    todo: List,
    doing: List,
    done: List,
    failed: List,
    jobs: PayloadStore<M>,
}

impl<M> Core<M> {
    async fn push<T>(&self, task: &mut T, id_gen: &dyn IdGenerator) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        ensure_identifier(task, id_gen);
        let id = task
            .identifier()
            .expect("ensure_identifier always installs one");
        let (p, r) = tokio::join!(self.jobs.set(task), self.todo.push(&id));
        Error::join(p, r.map(|_| ()))
    }

    async fn process<T>(&self, out: &mut T) -> Result<bool>
    where
        T: Task,
        M: Marshaller<T>,
    {
        match self.todo.pop_pipe(&self.doing).await? {
            None => Ok(false),
            Some(id) => {
                self.jobs.get(&id, out).await?;
                Ok(true)
            }
        }
    }

    async fn blocking_process<T>(&self, timeout: Duration, out: &mut T) -> Result<bool>
    where
        T: Task,
        M: Marshaller<T>,
    {
        match self.todo.blocking_pop_pipe(&self.doing, timeout).await? {
            None => Ok(false),
            Some(id) => {
                self.jobs.get(&id, out).await?;
                Ok(true)
            }
        }
    }

    async fn finish<T>(&self, task: &T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let id = task
            .identifier()
            .ok_or(Error::Misconfiguration("finish() called on a task with no identifier"))?;

        let payload_leg = async {
            if self.config.keep_done_tasks {
                self.jobs.set(task).await
            } else {
                self.jobs.delete(&id).await
            }
        };
        let reference_leg = async {
            if self.config.use_done_queue {
                if self.doing.pull_pipe(&self.done, &id).await? > 0 {
                    return Ok(());
                }
                if self.failed.pull_pipe(&self.done, &id).await? > 0 {
                    return Ok(());
                }
            } else {
                if self.doing.pull(&id).await? > 0 {
                    return Ok(());
                }
                if self.failed.pull(&id).await? > 0 {
                    return Ok(());
                }
            }
            Err(Error::MissingReference {
                list: "doing or failed",
                id: String::from_utf8_lossy(&id).into_owned(),
            })
        };

        let (p, r) = tokio::join!(payload_leg, reference_leg);
        Error::join(p, r)
    }

    async fn fail<T>(&self, task: &T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let id = task
            .identifier()
            .ok_or(Error::Misconfiguration("fail() called on a task with no identifier"))?;

        let payload_leg = self.jobs.set(task);
        let reference_leg = async {
            if self.doing.pull_pipe(&self.failed, &id).await? > 0 {
                Ok(())
            } else {
                Err(Error::MissingReference {
                    list: "doing",
                    id: String::from_utf8_lossy(&id).into_owned(),
                })
            }
        };

        let (p, r) = tokio::join!(payload_leg, reference_leg);
        Error::join(p, r)
    }

    async fn remove<T>(
        &self,
        list: &List,
        list_label: &'static str,
        task: &T,
        keep_in_storage: bool,
    ) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let id = task
            .identifier()
            .ok_or(Error::Misconfiguration("remove() called on a task with no identifier"))?;

        let payload_leg = async {
            if keep_in_storage {
                self.jobs.set(task).await
            } else {
                self.jobs.delete(&id).await
            }
        };
        let reference_leg = async {
            if list.pull(&id).await? > 0 {
                Ok(())
            } else {
                Err(Error::MissingReference {
                    list: list_label,
                    id: String::from_utf8_lossy(&id).into_owned(),
                })
            }
        };

        let (p, r) = tokio::join!(payload_leg, reference_leg);
        Error::join(p, r)
    }
}

/// The reliable work-queue protocol: four reference lists (`todo`, `doing`,
/// `done`, `failed`) plus a payload store, composed into push / claim /
/// finish / fail / remove and an optional deferred-scheduling path.
///
/// `T` is the task type this queue moves: one `ReliableQueue` handles one
/// task shape, since `push`/`process`/`finish`/`fail` all need to marshal
/// and unmarshal the same type. Use [`crate::task::MapTask`] for untyped
/// payloads or [`crate::task::Record`] to wrap a structured type.
pub struct ReliableQueue<T, M = JsonMarshaller> {
    core: Core<M>,
    deferred: DeferredEngine,
    recurring: RecurringEngine,
    id_gen: Arc<dyn IdGenerator>,
    listener_created: AtomicBool,
    _task: PhantomData<fn() -> T>,
}

impl<T> ReliableQueue<T, JsonMarshaller> {
    /// Build a queue against a fresh connection pool, using the default
    /// JSON marshaller and a random-UUID identifier generator.
    pub fn new(connection: ConnectionConfig, config: Config) -> Result<Self> {
        Self::with_marshaller(connection, config, JsonMarshaller)
    }
}

impl<T, M> ReliableQueue<T, M> {
    pub fn with_marshaller(
        connection: ConnectionConfig,
        config: Config,
        marshaller: M,
    ) -> Result<Self> {
        config.validate()?;
        let pool = connection.build_pool()?;
        let redis_url = connection.redis_url.clone();
        let config = Arc::new(config);

        let core = Core {
            todo: List::new(pool.clone(), redis_url.clone(), config.key("todo")),
            doing: List::new(pool.clone(), redis_url.clone(), config.key("doing")),
            done: List::new(pool.clone(), redis_url.clone(), config.key("done")),
            failed: List::new(pool.clone(), redis_url, config.key("failed")),
            jobs: PayloadStore::with_marshaller(pool.clone(), config.key("jobs") + &config.delim, marshaller),
            config: config.clone(),
        };

        Ok(Self {
            core,
            deferred: DeferredEngine::new(pool.clone(), config.key("deferred")),
            recurring: RecurringEngine::new(pool, config.key("recurring")),
            id_gen: Arc::new(UuidGenerator),
            listener_created: AtomicBool::new(false),
            _task: PhantomData,
        })
    }

    /// Override the default [`UuidGenerator`].
    pub fn with_id_generator(mut self, id_gen: impl IdGenerator + 'static) -> Self {
        self.id_gen = Arc::new(id_gen);
        self
    }

    pub fn todo(&self) -> &List {
        &self.core.todo
    }

    pub fn doing(&self) -> &List {
        &self.core.doing
    }

    pub fn done(&self) -> &List {
        &self.core.done
    }

    pub fn failed(&self) -> &List {
        &self.core.failed
    }

    /// Register this queue's metrics with `registry`. Safe to call multiple
    /// times across queues sharing one registry: `prometheus` rejects
    /// duplicate registration, which surfaces here as an error.
    pub fn register_metrics(&self, registry: &prometheus::Registry) -> std::result::Result<(), prometheus::Error> {
        stats::register_metrics(registry)
    }

    /// Push `task` onto `todo`, minting an identifier first if it doesn't
    /// already have one.
    pub async fn push(&self, task: &mut T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let res = self.core.push(task, self.id_gen.as_ref()).await;
        match &res {
            Ok(()) => {
                stats::PUSHED.inc();
                debug!("pushed task onto {}", self.core.todo.key());
            }
            Err(e) => {
                stats::ERRORS.with_label_values(&["push"]).inc();
                warn!("push failed: {e}");
            }
        }
        res
    }

    /// Claim one task, non-blocking. `Ok(false)` means `todo` was empty.
    pub async fn process(&self, out: &mut T) -> Result<bool>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let res = self.core.process(out).await;
        self.account_claim(&res);
        res
    }

    /// Claim one task, blocking server-side up to `timeout` (`Duration::ZERO`
    /// blocks indefinitely). `Ok(false)` means the timeout elapsed with
    /// nothing to claim.
    pub async fn blocking_process(&self, timeout: Duration, out: &mut T) -> Result<bool>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let res = self.core.blocking_process(timeout, out).await;
        self.account_claim(&res);
        res
    }

    fn account_claim(&self, res: &Result<bool>) {
        match res {
            Ok(true) => {
                stats::CLAIMED.inc();
                debug!("claimed task from {} into {}", self.core.todo.key(), self.core.doing.key());
            }
            Ok(false) => {}
            Err(e) => {
                stats::ERRORS.with_label_values(&["process"]).inc();
                warn!("process failed: {e}");
            }
        }
    }

    /// Move `task` from `doing` (or `failed`) to terminal state: deleted from
    /// the payload store unless `keep_done_tasks` is set, and either dropped
    /// or moved to `done` depending on `use_done_queue`.
    pub async fn finish(&self, task: &T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let res = self.core.finish(task).await;
        match &res {
            Ok(()) => {
                stats::FINISHED.inc();
                debug!("finished task");
            }
            Err(e) => {
                stats::ERRORS.with_label_values(&["finish"]).inc();
                warn!("finish failed: {e}");
            }
        }
        res
    }

    /// Move `task` from `doing` to `failed`, keeping its payload.
    pub async fn fail(&self, task: &T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let res = self.core.fail(task).await;
        match &res {
            Ok(()) => {
                stats::FAILED.inc();
                debug!("failed task");
            }
            Err(e) => {
                stats::ERRORS.with_label_values(&["fail"]).inc();
                warn!("fail failed: {e}");
            }
        }
        res
    }

    /// Pull `task` out of an arbitrary reference list (most commonly
    /// [`Self::failed`]) and drop or retain its payload.
    pub async fn remove(&self, list: &List, list_label: &'static str, task: &T, keep_in_storage: bool) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let res = self.core.remove(list, list_label, task, keep_in_storage).await;
        match &res {
            Ok(()) => {
                stats::REMOVED.inc();
                debug!("removed task from {}", list.key());
            }
            Err(e) => {
                stats::ERRORS.with_label_values(&["remove"]).inc();
                warn!("remove failed: {e}");
            }
        }
        res
    }

    /// Fetch the stored payload for `id` directly, bypassing the reference
    /// lists. Useful for inspection/debugging; the queue protocol itself
    /// never needs to call this on its own.
    pub async fn get_payload(&self, id: &[u8], out: &mut T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        self.core.jobs.get(id, out).await
    }

    /// Schedule `task` to land on `todo` at `when`, instead of immediately.
    /// Requires `Config::allow_defer`.
    pub async fn defer(&self, task: &mut T, when: std::time::SystemTime) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        if !self.core.config.allow_defer {
            return Err(Error::Misconfiguration(
                "defer() called without Config::allow_defer",
            ));
        }
        ensure_identifier(task, self.id_gen.as_ref());
        self.core.jobs.set(task).await?;
        self.deferred.add(
            &task.identifier().expect("just minted"),
            Timestamp::from_system_time(when),
        )
        .await
    }

    /// Move everything due by now from the deferred set onto `todo`.
    pub async fn tick_deferred(&self) -> Result<Vec<Vec<u8>>> {
        self.deferred.tick(&self.core.todo, Timestamp::now()).await
    }

    /// Move everything due by now from the recurring set onto `todo`,
    /// rescheduling each for its next interval.
    pub async fn tick_recurring(&self) -> Result<Vec<Vec<u8>>> {
        self.recurring.tick(&self.core.todo, Timestamp::now()).await
    }

    pub fn recurring(&self) -> &RecurringEngine {
        &self.recurring
    }

    /// Snapshot the current lengths of `todo` and `doing` into the gauge
    /// metrics. Call this periodically; it is not wired to any timer itself.
    pub async fn sample_depths(&self) -> Result<()> {
        let (todo_len, doing_len) = tokio::try_join!(self.core.todo.length(), self.core.doing.length())?;
        stats::TODO_DEPTH.set(todo_len as i64);
        stats::DOING_DEPTH.set(doing_len as i64);
        Ok(())
    }

    /// Build the push-driven listener, memoized per queue: the first call
    /// spawns the background hydrate/finish/fail tasks and returns ownership
    /// of the four channel endpoints; subsequent calls error rather than
    /// spawn a second `BRPOPLPUSH` loop racing the first for the same
    /// elements. `factory` must produce a fresh, empty `T` for each claimed
    /// identifier to be unmarshalled into.
    pub fn listen<F>(&self, factory: F) -> Result<TaskListener<T>>
    where
        T: Task + Send + 'static,
        M: Marshaller<T> + Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        if self.listener_created.swap(true, Ordering::SeqCst) {
            return Err(Error::Misconfiguration(
                "listen() already called on this queue",
            ));
        }

        let list_listener = self.core.todo.pop_pipe_listen(&self.core.doing);
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (finish_tx, finish_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let hydrate_handle = tokio::spawn(hydrate_loop(
            list_listener,
            self.core.jobs.clone(),
            tasks_tx,
            errors_tx.clone(),
            factory,
        ));

        let finish_core = self.core.clone();
        let finish_errors = errors_tx.clone();
        let finish_handle = tokio::spawn(sink_loop(finish_rx, finish_errors, move |task| {
            let core = finish_core.clone();
            async move { core.finish(&task).await }
        }));

        let fail_core = self.core.clone();
        let fail_handle = tokio::spawn(sink_loop(fail_rx, errors_tx, move |task| {
            let core = fail_core.clone();
            async move { core.fail(&task).await }
        }));

        Ok(TaskListener {
            tasks: tasks_rx,
            finish: Some(finish_tx),
            fail: Some(fail_tx),
            errors: errors_rx,
            hydrate_handle: Some(hydrate_handle),
            finish_handle: Some(finish_handle),
            fail_handle: Some(fail_handle),
        })
    }
}

impl<M> ReliableQueue<MapTask, M> {
    /// Construct an empty `MapTask` using this queue's configured
    /// `id_field`, so identifiers land in the same field `push`/`process`
    /// expect regardless of what `Config::id_field` was set to.
    pub fn new_task(&self) -> MapTask {
        MapTask::with_id_field(self.core.config.id_field.clone())
    }
}

async fn hydrate_loop<T, M, F>(
    mut list_listener: list::Listener,
    jobs: PayloadStore<M>,
    tasks_tx: mpsc::UnboundedSender<T>,
    errors_tx: mpsc::UnboundedSender<Error>,
    factory: F,
) where
    T: Task + Send + 'static,
    M: Marshaller<T> + Send + Sync + 'static,
    F: Fn() -> T + Send + 'static,
{
    let mut elements_open = true;
    let mut errors_open = true;

    while elements_open || errors_open {
        tokio::select! {
            elem = list_listener.elements.recv(), if elements_open => {
                match elem {
                    Some(id) => {
                        let mut instance = factory();
                        match jobs.get(&id, &mut instance).await {
                            Ok(()) => {
                                if tasks_tx.send(instance).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                if errors_tx.send(e).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => elements_open = false,
                }
            }
            err = list_listener.errors.recv(), if errors_open => {
                match err {
                    Some(e) => {
                        if errors_tx.send(e).is_err() {
                            break;
                        }
                    }
                    None => errors_open = false,
                }
            }
        }
    }
}

async fn sink_loop<T, Fut>(
    mut rx: mpsc::UnboundedReceiver<T>,
    errors_tx: mpsc::UnboundedSender<Error>,
    op: impl Fn(T) -> Fut + Send + 'static,
) where
    T: Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    while let Some(task) = rx.recv().await {
        if let Err(e) = op(task).await {
            if errors_tx.send(e).is_err() {
                break;
            }
        }
    }
}

/// The push-driven consumer side of [`ReliableQueue::listen`]: freshly
/// claimed tasks arrive on `tasks`; send a claimed task back on `finish` or
/// `fail` to complete it; transport errors from any of the three background
/// loops (hydrate, finish-sink, fail-sink) arrive on `errors`.
///
/// `errors` closes once all three loops have ended. Each loop holds one
/// clone of the same sender, so this falls out of `mpsc`'s own
/// reference-counting rather than any bookkeeping of ours.
pub struct TaskListener<T> {
    pub tasks: mpsc::UnboundedReceiver<T>,
    pub finish: Option<mpsc::UnboundedSender<T>>,
    pub fail: Option<mpsc::UnboundedSender<T>>,
    pub errors: mpsc::UnboundedReceiver<Error>,
    hydrate_handle: Option<JoinHandle<()>>,
    finish_handle: Option<JoinHandle<()>>,
    fail_handle: Option<JoinHandle<()>>,
}

impl<T> TaskListener<T> {
    /// Drop the `finish` sink, letting its background loop drain and exit.
    pub fn close_finish(&mut self) {
        self.finish = None;
    }

    /// Drop the `fail` sink, letting its background loop drain and exit.
    pub fn close_fail(&mut self) {
        self.fail = None;
    }

    /// Tear down the underlying list listener. `tasks` closes once the
    /// in-flight hydrate loop notices; callers are expected to also drop
    /// `finish`/`fail` (via [`Self::close_finish`]/[`Self::close_fail`]) so
    /// `errors` closes too.
    pub async fn close(&mut self) {
        if let Some(handle) = self.hydrate_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.close_finish();
        self.close_fail();
        if let Some(handle) = self.finish_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.fail_handle.take() {
            let _ = handle.await;
        }
    }
}

impl<T> Drop for TaskListener<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.hydrate_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.finish_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.fail_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_empty_prefix() {
        let cfg = Config::new("");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_key_joins_with_delim() {
        let cfg = Config::new("myq").delim("/");
        assert_eq!(cfg.key("todo"), "myq/todo");
    }
}
