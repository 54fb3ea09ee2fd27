//! StoreManager: the registry that sets up a store and hands out contexts.
//!
//! One manager owns at most one stack (configuration, coordinator, main
//! context, worker contexts) at a time. Managers are plain values, so tests
//! can run isolated instances side by side.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread::ThreadId;

use crate::config::{
    default_data_dir, validate_store_name, StoreConfiguration, DEFAULT_STORE_FILE_NAME,
    STORE_METADATA_KEY_EXCLUDED_FROM_BACKUP, STORE_METADATA_KEY_FILE_NAME,
    STORE_METADATA_KEY_URL,
};
use crate::error::{Error, Result};
use crate::model::{Model, SchemaProvider};
use crate::store::{
    remove_store_files, write_metadata, Condition, Context, Coordinator, FetchRequest,
    LightweightMigrator, Migrator, Record, SortDescriptor,
};

/// Shared handle to a context. Lock it for the duration of one unit of work.
///
/// The manager's save, count and fetch helpers do not wait for the main
/// context: while any guard on it is alive, including one held by the
/// calling thread, they fail with [`Error::ContextBusy`] and report
/// `false`, `0` or nothing.
pub type ContextHandle = Arc<Mutex<Context>>;

type WorkerMap = Mutex<HashMap<ThreadId, ContextHandle>>;

struct Stack {
    config: StoreConfiguration,
    url: PathBuf,
    model: Arc<Model>,
    coordinator: Arc<Coordinator>,
    main: ContextHandle,
    workers: Arc<WorkerMap>,
}

/// Removes a worker context from its stack when the owning thread exits.
struct WorkerRelease {
    workers: Weak<WorkerMap>,
    thread: ThreadId,
}

impl Drop for WorkerRelease {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.upgrade() {
            let released = lock(&*workers).remove(&self.thread);
            if released.is_some() {
                crate::dlog!("released worker context of exited {:?}", self.thread);
            }
        }
    }
}

thread_local! {
    static WORKER_RELEASES: RefCell<Vec<WorkerRelease>> = RefCell::new(Vec::new());
}

pub struct StoreManager {
    base_dir: PathBuf,
    schema: Box<dyn SchemaProvider>,
    migrator: Box<dyn Migrator>,
    model: Mutex<Option<Arc<Model>>>,
    stack: Mutex<Option<Stack>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock a context without waiting.
fn try_lock_context(handle: &ContextHandle) -> Result<MutexGuard<'_, Context>> {
    match handle.try_lock() {
        Ok(context) => Ok(context),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(Error::ContextBusy(
            "the main context is locked".to_string(),
        )),
    }
}

impl StoreManager {
    /// Manager rooted at the default data directory.
    pub fn new(schema: impl SchemaProvider + 'static) -> Result<Self> {
        Ok(Self::with_base_dir(schema, default_data_dir()?))
    }

    /// Manager rooted at `base_dir`.
    pub fn with_base_dir(schema: impl SchemaProvider + 'static, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            schema: Box::new(schema),
            migrator: Box::new(LightweightMigrator),
            model: Mutex::new(None),
            stack: Mutex::new(None),
        }
    }

    /// Replace the migrator used by later setup calls.
    pub fn with_migrator(mut self, migrator: impl Migrator + 'static) -> Self {
        self.migrator = Box::new(migrator);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The model, loaded on first use. A missing model is a fatal
    /// configuration error.
    pub fn shared_model(&self) -> Result<Arc<Model>> {
        let mut memo = lock(&self.model);
        if let Some(model) = memo.as_ref() {
            return Ok(model.clone());
        }

        let model = match self.schema.load_model()? {
            Some(model) => model,
            None => {
                crate::alog!("no model found in {}", self.schema.describe());
                return Err(Error::Model(format!(
                    "no model found in {}",
                    self.schema.describe()
                )));
            }
        };
        model.validate()?;

        tracing::debug!(
            "Loaded model v{} with {} entities from {}",
            model.version,
            model.entities.len(),
            self.schema.describe()
        );
        let model = Arc::new(model);
        *memo = Some(model.clone());
        Ok(model)
    }

    /// The main context.
    pub fn shared_context(&self) -> Result<ContextHandle> {
        let stack = lock(&self.stack);
        stack.as_ref().map(|s| s.main.clone()).ok_or(Error::NotSetUp)
    }

    /// A new context on the shared store, owned by the caller. Every call
    /// returns a distinct context.
    pub fn shared_threaded_context(&self) -> Result<Context> {
        let stack = lock(&self.stack);
        let stack = stack.as_ref().ok_or(Error::NotSetUp)?;
        let conn = stack.coordinator.connect()?;
        Ok(Context::new(conn, stack.model.clone(), "threaded"))
    }

    /// The context dedicated to the calling thread, created on first use and
    /// released when the thread exits.
    pub fn worker_context(&self) -> Result<ContextHandle> {
        let worker = std::thread::current().id();
        let (handle, workers) = {
            let stack = lock(&self.stack);
            let stack = stack.as_ref().ok_or(Error::NotSetUp)?;
            let mut workers = lock(&*stack.workers);

            if let Some(handle) = workers.get(&worker) {
                return Ok(handle.clone());
            }

            let conn = stack.coordinator.connect()?;
            let label = format!("worker-{:?}", worker);
            let handle = Arc::new(Mutex::new(Context::new(conn, stack.model.clone(), &label)));
            workers.insert(worker, handle.clone());
            crate::dlog!("created {} ({} worker contexts)", label, workers.len());
            (handle, Arc::downgrade(&stack.workers))
        };

        // Fails only while the thread is already shutting down.
        let _ = WORKER_RELEASES.try_with(|releases| {
            let mut releases = releases.borrow_mut();
            releases.retain(|release| release.workers.strong_count() > 0);
            releases.push(WorkerRelease {
                workers,
                thread: worker,
            });
        });
        Ok(handle)
    }

    /// Release the calling thread's worker context now rather than at thread
    /// exit. Returns whether there was one.
    pub fn release_worker_context(&self) -> bool {
        let worker = std::thread::current().id();
        let stack = lock(&self.stack);
        let released = stack
            .as_ref()
            .and_then(|stack| lock(&*stack.workers).remove(&worker));
        released.is_some()
    }

    /// Number of live worker contexts.
    pub fn worker_context_count(&self) -> usize {
        lock(&self.stack)
            .as_ref()
            .map_or(0, |stack| lock(&*stack.workers).len())
    }

    /// Location of the current store, or of the default store before setup.
    pub fn store_url(&self) -> PathBuf {
        match lock(&self.stack).as_ref() {
            Some(stack) => stack.url.clone(),
            None => self.base_dir.join(DEFAULT_STORE_FILE_NAME),
        }
    }

    /// Location of the store called `name` in the data directory.
    pub fn url_for_store_name(&self, name: &str) -> Result<PathBuf> {
        validate_store_name(name)?;
        Ok(self.base_dir.join(name))
    }

    /// Configuration of the current stack.
    pub fn configuration(&self) -> Option<StoreConfiguration> {
        lock(&self.stack).as_ref().map(|s| s.config.clone())
    }

    pub fn is_set_up(&self) -> bool {
        lock(&self.stack).is_some()
    }

    /// Auto-migrating, journaled store in `name`.
    pub fn setup_with_sqlite_file_name(&self, name: &str) -> Result<()> {
        self.setup(StoreConfiguration::sqlite(name))
    }

    /// Auto-migrating store in `name`, with or without WAL journaling.
    pub fn setup_sqlite_stack(&self, name: &str, has_journaling: bool) -> Result<()> {
        self.setup(StoreConfiguration::sqlite(name).with_journaling(has_journaling))
    }

    /// Default store, flagged as excluded from backups.
    pub fn setup_auto_migrating_with_do_not_backup(&self) -> Result<()> {
        self.setup(
            StoreConfiguration::sqlite(DEFAULT_STORE_FILE_NAME).with_exclude_from_backup(true),
        )
    }

    /// Default store.
    pub fn setup_auto_migrating(&self) -> Result<()> {
        self.setup(StoreConfiguration::sqlite(DEFAULT_STORE_FILE_NAME))
    }

    /// Memory-only store.
    pub fn setup_in_memory(&self) -> Result<()> {
        self.setup(StoreConfiguration::in_memory())
    }

    /// Set up the stack described by `config`. Repeating the same setup is a
    /// no-op; a different configuration requires `clean_up` first.
    pub fn setup(&self, config: StoreConfiguration) -> Result<()> {
        config.validate()?;

        let mut stack = lock(&self.stack);
        if let Some(existing) = stack.as_ref() {
            if existing.config == config {
                crate::dlog!("store {} already set up", config.store_name);
                return Ok(());
            }
            return Err(Error::Config(format!(
                "store already set up with '{}' ({}); clean up before switching to '{}' ({})",
                existing.config.store_name, existing.config.kind, config.store_name, config.kind
            )));
        }

        let model = self.shared_model()?;
        let url = self.url_for_store_name(&config.store_name)?;
        crate::zassert!(
            url.starts_with(&self.base_dir),
            "store {} resolved outside {}",
            url.display(),
            self.base_dir.display()
        );

        let built = self.build_stack(config, url, model);
        match built {
            Ok(new_stack) => {
                tracing::info!(
                    "Store set up at {} ({}, journal {})",
                    new_stack.coordinator.location(),
                    new_stack.config.kind,
                    new_stack.coordinator.journal_mode()
                );
                *stack = Some(new_stack);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to set up store: {}", e);
                Err(e)
            }
        }
    }

    fn build_stack(&self, config: StoreConfiguration, url: PathBuf, model: Arc<Model>) -> Result<Stack> {
        let coordinator = Arc::new(Coordinator::open(&config, &url)?);

        let report = coordinator.with_anchor(|conn| {
            self.migrator.migrate(conn, &model, config.auto_migrate)
        })?;
        crate::dlog!(
            "migration from {:?} to v{}: {} tables, {} columns",
            report.from_version,
            report.to_version,
            report.created_tables.len(),
            report.added_columns.len()
        );

        let location = coordinator.location().to_string();
        coordinator.with_anchor(|conn| {
            write_metadata(
                conn,
                &[
                    (STORE_METADATA_KEY_FILE_NAME, config.store_name.clone()),
                    (STORE_METADATA_KEY_URL, location),
                    (
                        STORE_METADATA_KEY_EXCLUDED_FROM_BACKUP,
                        String::from(if config.exclude_from_backup { "1" } else { "0" }),
                    ),
                ],
            )
        })?;

        let main = Context::new(coordinator.connect()?, model.clone(), "main");

        Ok(Stack {
            config,
            url,
            model,
            coordinator,
            main: Arc::new(Mutex::new(main)),
            workers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Release every context, the model and the coordinator. Contexts still
    /// held elsewhere keep their connection open until they are dropped.
    pub fn clean_up(&self) {
        let stack = lock(&self.stack).take();
        if let Some(stack) = stack {
            let workers = std::mem::take(&mut *lock(&*stack.workers));
            stack.coordinator.close();
            tracing::info!(
                "Released store {} ({} worker contexts)",
                stack.config.store_name,
                workers.len()
            );
        }
        lock(&self.model).take();
    }

    /// Save the main context. Failures are logged and reported as `false`;
    /// the staged changes are kept. Does not wait for a locked main context.
    pub fn save_context(&self) -> bool {
        let main = match self.shared_context() {
            Ok(main) => main,
            Err(e) => {
                tracing::error!("Cannot save context: {}", e);
                return false;
            }
        };

        let mut context = match try_lock_context(&main) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!("Cannot save context: {}", e);
                return false;
            }
        };
        if !context.has_changes() {
            return true;
        }
        match context.save() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save context {}: {}", context.label(), e);
                false
            }
        }
    }

    /// Build a fetch request. `limit` 0 means unlimited. No I/O.
    pub fn fetch_request_for_entity_name(
        entity: &str,
        condition: Option<Condition>,
        sort: Vec<SortDescriptor>,
        limit: usize,
    ) -> FetchRequest {
        let request = FetchRequest::new(entity).with_sort(sort).with_limit(limit);
        match condition {
            Some(condition) => request.with_condition(condition),
            None => request,
        }
    }

    /// Count against the main context. Errors are logged and count as 0.
    pub fn count_for_fetch_request(&self, request: &FetchRequest) -> usize {
        let result = self
            .shared_context()
            .and_then(|main| {
                let context = try_lock_context(&main)?;
                context.count(request)
            });
        match result {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Count on {} failed: {}", request.entity, e);
                0
            }
        }
    }

    /// Fetch against the main context. Errors are logged and yield nothing.
    pub fn execute_fetch_request(&self, request: &FetchRequest) -> Vec<Record> {
        let result = self
            .shared_context()
            .and_then(|main| {
                let context = try_lock_context(&main)?;
                context.execute(request)
            });
        match result {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Fetch on {} failed: {}", request.entity, e);
                Vec::new()
            }
        }
    }

    /// Delete the current store and its sidecar files, releasing the stack
    /// first. Does nothing for an in-memory store. Test use only.
    pub fn drop_store(&self) -> Result<()> {
        if let Some(config) = self.configuration() {
            if !config.is_file_backed() {
                crate::dlog!("in-memory store, nothing to drop");
                return Ok(());
            }
        }

        let url = self.store_url();
        self.clean_up();
        let removed = remove_store_files(&url)?;
        tracing::info!("Dropped store {} ({} files)", url.display(), removed.len());
        Ok(())
    }

    /// Delete the store called `name` and its sidecar files. If the live
    /// stack uses that store it is released first. Test use only.
    pub fn drop_database(&self, name: &str) -> Result<()> {
        let url = self.url_for_store_name(name)?;
        let in_use = self
            .configuration()
            .map(|c| c.is_file_backed() && c.store_name == name)
            .unwrap_or(false);
        if in_use {
            self.clean_up();
        }

        let removed = remove_store_files(&url)?;
        tracing::info!("Dropped store {} ({} files)", url.display(), removed.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::STORE_METADATA_KEY_MODEL_VERSION;
    use crate::model::{AttributeDescription, AttributeType, EntityDescription, ResourceBundle, StaticSchema};
    use crate::store::{read_metadata_at, sidecar_paths, Value};
    use tempfile::TempDir;

    fn model(version: u32) -> Model {
        let mut person = EntityDescription::new("Person")
            .attribute(AttributeDescription::new("name", AttributeType::Text).required())
            .attribute(AttributeDescription::new("age", AttributeType::Integer));
        if version > 1 {
            person = person.attribute(AttributeDescription::new("email", AttributeType::Text));
        }
        Model::new(version).entity(person)
    }

    fn manager(dir: &TempDir) -> StoreManager {
        crate::logging::init_test();
        StoreManager::with_base_dir(StaticSchema(model(1)), dir.path())
    }

    fn person(name: &str, age: i64) -> Record {
        Record::new("Person")
            .with("name", name.to_string())
            .with("age", age)
    }

    fn add_people(manager: &StoreManager, count: i64) {
        let main = manager.shared_context().unwrap();
        let mut ctx = main.lock().unwrap();
        for i in 0..count {
            ctx.insert(person(&format!("p{}", i), i)).unwrap();
        }
    }

    fn all_people() -> FetchRequest {
        StoreManager::fetch_request_for_entity_name("Person", None, Vec::new(), 0)
    }

    #[test]
    fn test_url_for_store_name_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let a = manager.url_for_store_name("app.sqlite").unwrap();
        let b = manager.url_for_store_name("app.sqlite").unwrap();
        let c = manager.url_for_store_name("other.sqlite").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.parent(), c.parent());
        assert!(a.starts_with(dir.path()));
        assert!(manager.url_for_store_name("../escape.sqlite").is_err());

        assert_eq!(manager.store_url(), dir.path().join(DEFAULT_STORE_FILE_NAME));
    }

    #[test]
    fn test_in_memory_store_touches_no_files() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();

        add_people(&manager, 3);
        assert!(manager.save_context());
        assert_eq!(manager.count_for_fetch_request(&all_people()), 3);

        manager.drop_store().unwrap();
        assert!(manager.is_set_up());
        assert_eq!(manager.count_for_fetch_request(&all_people()), 3);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_save_and_refetch_from_file_store() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_auto_migrating().unwrap();

        {
            let main = manager.shared_context().unwrap();
            main.lock().unwrap().insert(person("Ada", 36)).unwrap();
        }
        assert!(manager.save_context());
        assert!(manager.store_url().exists());

        let request = StoreManager::fetch_request_for_entity_name(
            "Person",
            Some(Condition::equals("name", "Ada".to_string())),
            Vec::new(),
            0,
        );
        let found = manager.execute_fetch_request(&request);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text("name"), Some("Ada"));
        assert_eq!(found[0].integer("age"), Some(36));

        // Survives a full teardown.
        manager.clean_up();
        manager.setup_auto_migrating().unwrap();
        let again = manager.execute_fetch_request(&request);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id(), found[0].id());
    }

    #[test]
    fn test_fetch_limit() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();
        add_people(&manager, 5);
        assert!(manager.save_context());

        let adults = Condition::predicate("\"age\" >= ?", [1i64]);
        let unlimited = StoreManager::fetch_request_for_entity_name(
            "Person",
            Some(adults.clone()),
            vec![SortDescriptor::descending("age")],
            0,
        );
        assert_eq!(manager.execute_fetch_request(&unlimited).len(), 4);

        let limited = StoreManager::fetch_request_for_entity_name(
            "Person",
            Some(adults),
            vec![SortDescriptor::descending("age")],
            2,
        );
        let records = manager.execute_fetch_request(&limited);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].integer("age"), Some(4));
        assert_eq!(manager.count_for_fetch_request(&limited), 2);
    }

    #[test]
    fn test_clean_up_then_setup_again() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_auto_migrating().unwrap();
        let first = manager.shared_context().unwrap();

        manager.clean_up();
        assert!(!manager.is_set_up());
        assert!(matches!(manager.shared_context(), Err(Error::NotSetUp)));
        drop(first);

        manager.setup_auto_migrating().unwrap();
        add_people(&manager, 2);
        assert!(manager.save_context());
        assert_eq!(manager.count_for_fetch_request(&all_people()), 2);
    }

    #[test]
    fn test_drop_database_removes_files_and_resets() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_with_sqlite_file_name("drop.sqlite").unwrap();
        add_people(&manager, 3);
        assert!(manager.save_context());

        let url = manager.url_for_store_name("drop.sqlite").unwrap();
        manager.drop_database("drop.sqlite").unwrap();
        assert!(!manager.is_set_up());
        assert!(!url.exists());

        // Leftover sidecars from a crashed run go too.
        std::fs::write(&url, b"stale").unwrap();
        for sidecar in sidecar_paths(&url) {
            std::fs::write(sidecar, b"stale").unwrap();
        }
        manager.drop_database("drop.sqlite").unwrap();
        assert!(!url.exists());
        for sidecar in sidecar_paths(&url) {
            assert!(!sidecar.exists());
        }

        manager.setup_with_sqlite_file_name("drop.sqlite").unwrap();
        assert_eq!(manager.count_for_fetch_request(&all_people()), 0);
    }

    #[test]
    fn test_drop_store_uses_current_store() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_sqlite_stack("plain.sqlite", false).unwrap();
        let url = manager.store_url();
        assert_eq!(url, dir.path().join("plain.sqlite"));
        assert!(url.exists());

        manager.drop_store().unwrap();
        assert!(!url.exists());
        assert!(!manager.is_set_up());
    }

    #[test]
    fn test_save_without_setup_fails() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(!manager.save_context());
        assert_eq!(manager.count_for_fetch_request(&all_people()), 0);
        assert!(manager.execute_fetch_request(&all_people()).is_empty());
    }

    #[test]
    fn test_failed_save_returns_false_and_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();

        let main = manager.shared_context().unwrap();
        main.lock().unwrap().delete("Person", 42).unwrap();
        assert!(!manager.save_context());
        assert!(main.lock().unwrap().has_changes());

        main.lock().unwrap().rollback();
        assert!(manager.save_context());
    }

    #[test]
    fn test_count_and_fetch_errors_degrade() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();
        add_people(&manager, 2);
        assert!(manager.save_context());

        let unknown = StoreManager::fetch_request_for_entity_name("Robot", None, Vec::new(), 0);
        assert_eq!(manager.count_for_fetch_request(&unknown), 0);
        assert!(manager.execute_fetch_request(&unknown).is_empty());

        let bad_predicate = StoreManager::fetch_request_for_entity_name(
            "Person",
            Some(Condition::from("no_such_column = 1")),
            Vec::new(),
            0,
        );
        assert_eq!(manager.count_for_fetch_request(&bad_predicate), 0);
    }

    #[test]
    fn test_setup_is_idempotent_but_refuses_switching() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_auto_migrating().unwrap();
        manager.setup_auto_migrating().unwrap();
        assert!(matches!(manager.setup_in_memory(), Err(Error::Config(_))));
        assert!(matches!(
            manager.setup_with_sqlite_file_name(""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_store_metadata_is_recorded() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_auto_migrating_with_do_not_backup().unwrap();
        let url = manager.store_url();
        manager.clean_up();

        let metadata = read_metadata_at(&url).unwrap();
        assert_eq!(
            metadata.get(STORE_METADATA_KEY_FILE_NAME).map(String::as_str),
            Some(DEFAULT_STORE_FILE_NAME)
        );
        assert_eq!(
            metadata.get(STORE_METADATA_KEY_URL),
            Some(&url.display().to_string())
        );
        assert_eq!(
            metadata.get(STORE_METADATA_KEY_EXCLUDED_FROM_BACKUP).map(String::as_str),
            Some("1")
        );
        assert_eq!(
            metadata.get(STORE_METADATA_KEY_MODEL_VERSION).map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_contexts_share_committed_data() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_auto_migrating().unwrap();

        let mut threaded = manager.shared_threaded_context().unwrap();
        let other = manager.shared_threaded_context().unwrap();
        threaded.insert(person("Grace", 85)).unwrap();
        threaded.save().unwrap();

        assert_eq!(other.count(&all_people()).unwrap(), 1);
        assert_eq!(manager.count_for_fetch_request(&all_people()), 1);
    }

    #[test]
    fn test_worker_contexts_are_per_thread() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(&dir));
        manager.setup_auto_migrating().unwrap();

        let here = manager.worker_context().unwrap();
        let again = manager.worker_context().unwrap();
        assert!(Arc::ptr_eq(&here, &again));

        let remote = Arc::clone(&manager);
        let handle = std::thread::spawn(move || {
            let ctx = remote.worker_context().unwrap();
            let mut ctx = ctx.lock().unwrap();
            ctx.insert(Record::new("Person").with("name", "Linus".to_string()))
                .unwrap();
            ctx.save().unwrap();
            Arc::as_ptr(&remote.worker_context().unwrap()) as usize
        });
        let remote_ptr = handle.join().unwrap();
        assert_ne!(remote_ptr, Arc::as_ptr(&here) as usize);

        let found = here.lock().unwrap().execute(&all_people()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("age"), None);
        assert_eq!(found[0].get("name"), Some(&Value::Text("Linus".to_string())));
    }

    #[test]
    fn test_worker_contexts_are_released_with_their_threads() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();

        let shared = &manager;
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..20)
                .map(move |_| {
                    s.spawn(move || {
                        shared.worker_context().unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
        assert_eq!(manager.worker_context_count(), 0);

        manager.worker_context().unwrap();
        assert_eq!(manager.worker_context_count(), 1);
        assert!(manager.release_worker_context());
        assert!(!manager.release_worker_context());
        assert_eq!(manager.worker_context_count(), 0);
    }

    #[test]
    fn test_workers_write_concurrently_in_memory() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();

        let shared = &manager;
        std::thread::scope(|s| {
            for t in 0..4 {
                s.spawn(move || {
                    let worker = shared.worker_context().unwrap();
                    for i in 0..10 {
                        let mut ctx = worker.lock().unwrap();
                        ctx.insert(person(&format!("t{}-{}", t, i), i)).unwrap();
                        ctx.save().unwrap();
                        assert!(ctx.count(&all_people()).unwrap() > 0);
                    }
                });
            }
        });
        assert_eq!(manager.count_for_fetch_request(&all_people()), 40);
    }

    #[test]
    fn test_save_while_reading_in_batches() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let configs = [
            StoreConfiguration::in_memory(),
            StoreConfiguration::sqlite("plain.sqlite").with_journaling(false),
            StoreConfiguration::sqlite("wal.sqlite"),
        ];

        for config in configs {
            manager.setup(config.clone()).unwrap();
            add_people(&manager, 4);
            assert!(manager.save_context());

            let reader = manager.shared_threaded_context().unwrap();
            let mut writer = manager.shared_threaded_context().unwrap();
            let mut failures = Vec::new();
            let request = all_people().with_limit(4).with_batch_size(2);
            reader
                .fetch_batches(&request, |batch| {
                    for record in batch {
                        let name = format!("copy of {}", record.text("name").unwrap_or("?"));
                        writer.insert(person(&name, 0))?;
                    }
                    if let Err(e) = writer.save() {
                        failures.push(e.to_string());
                    }
                    Ok(())
                })
                .unwrap();

            assert!(failures.is_empty(), "{}: {:?}", config.kind, failures);
            assert_eq!(manager.count_for_fetch_request(&all_people()), 8);
            manager.clean_up();
        }
    }

    #[test]
    fn test_unbounded_limit_and_offset() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();
        add_people(&manager, 3);
        assert!(manager.save_context());

        let everything =
            StoreManager::fetch_request_for_entity_name("Person", None, Vec::new(), usize::MAX);
        assert_eq!(manager.execute_fetch_request(&everything).len(), 3);
        assert_eq!(manager.count_for_fetch_request(&everything), 3);

        let past_the_end = all_people().with_offset(usize::MAX);
        let main = manager.shared_context().unwrap();
        let ctx = main.lock().unwrap();
        assert!(ctx.execute(&past_the_end).unwrap().is_empty());
        assert_eq!(ctx.count(&past_the_end).unwrap(), 0);
    }

    #[test]
    fn test_helpers_do_not_wait_for_a_locked_main_context() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.setup_in_memory().unwrap();
        add_people(&manager, 2);
        assert!(manager.save_context());

        let main = manager.shared_context().unwrap();
        let held = main.lock().unwrap();
        assert!(!manager.save_context());
        assert_eq!(manager.count_for_fetch_request(&all_people()), 0);
        assert!(manager.execute_fetch_request(&all_people()).is_empty());
        drop(held);

        assert!(manager.save_context());
        assert_eq!(manager.count_for_fetch_request(&all_people()), 2);
    }

    #[test]
    fn test_lightweight_migration_on_setup() {
        let dir = TempDir::new().unwrap();
        {
            let v1 = manager(&dir);
            v1.setup_auto_migrating().unwrap();
            add_people(&v1, 1);
            assert!(v1.save_context());
            v1.clean_up();
        }

        let v2 = StoreManager::with_base_dir(StaticSchema(model(2)), dir.path());
        v2.setup_auto_migrating().unwrap();
        let main = v2.shared_context().unwrap();
        {
            let mut ctx = main.lock().unwrap();
            ctx.insert(person("Ada", 36).with("email", "ada@example.com".to_string()))
                .unwrap();
        }
        assert!(v2.save_context());
        assert_eq!(v2.count_for_fetch_request(&all_people()), 2);
        v2.clean_up();

        // The old model cannot open a store written by a newer one.
        let old = manager(&dir);
        assert!(matches!(old.setup_auto_migrating(), Err(Error::Migration(_))));
    }

    #[test]
    fn test_shared_model_from_resource_bundle() {
        let dir = TempDir::new().unwrap();
        let resources = dir.path().join("resources");
        std::fs::create_dir_all(&resources).unwrap();
        std::fs::write(
            resources.join("app.model.json"),
            serde_json::to_string(&model(1)).unwrap(),
        )
        .unwrap();

        let manager = StoreManager::with_base_dir(ResourceBundle::new(&resources), dir.path());
        let first = manager.shared_model().unwrap();
        let second = manager.shared_model().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.entity_named("Person").is_some());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "no model found"))]
    fn test_missing_model_is_fatal() {
        let dir = TempDir::new().unwrap();
        let manager = StoreManager::with_base_dir(ResourceBundle::new(dir.path()), dir.path());
        assert!(matches!(manager.shared_model(), Err(Error::Model(_))));
    }
}
