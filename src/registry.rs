//! Process-wide map from backend name to constructor (spec.md §4.3).
//!
//! Grounded on `kvx`'s `KeyValueStore::new`, which dispatches on a URL
//! scheme to one of a fixed set of backend constructors; generalized here
//! into an explicit name -> constructor table built once, per spec.md
//! §9's design note preferring "a table of constructors keyed by name,
//! built at process start, not by dynamic introspection".

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::backend::{Backend, BackendConstructor};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};

static REGISTRY: Lazy<Mutex<HashMap<String, BackendConstructor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers `name` with `ctor`. Fails if `name` is already taken.
pub fn register(name: &str, ctor: BackendConstructor) -> StorageResult<()> {
    let mut registry = REGISTRY.lock().expect("backend registry mutex poisoned");
    if registry.contains_key(name) {
        return Err(StorageError::bad_config(format!(
            "backend '{name}' is already registered"
        )));
    }
    registry.insert(name.to_string(), ctor);
    Ok(())
}

/// Resolves `name` to its constructor and builds a backend from `config`.
pub fn construct(name: &str, config: &StorageConfig) -> StorageResult<Box<dyn Backend>> {
    ensure_builtins_registered();
    let registry = REGISTRY.lock().expect("backend registry mutex poisoned");
    let ctor = registry
        .get(name)
        .ok_or_else(|| StorageError::bad_config(format!("unknown storage_type '{name}'")))?;
    ctor(config)
}

/// The seven built-in backends, registered exactly once per process. Rust
/// has no static constructor hook comparable to a module-init function,
/// so `Lazy` plays that role: the closure runs once, on first access.
static BUILTINS: Lazy<()> = Lazy::new(|| {
    crate::backends::local::register().expect("register local backend");
    crate::backends::file::register().expect("register file backend");
    crate::backends::remote_memory::register().expect("register remote_memory backend");
    crate::backends::relational::register().expect("register relational backend");
    crate::backends::wide_column::register().expect("register wide_column backend");
    crate::backends::column_store::register().expect("register column_store backend");
    crate::backends::document::register().expect("register document backend");
});

fn ensure_builtins_registered() {
    Lazy::force(&BUILTINS);
}
