//! PolyKV: one storage contract, seven backing stores.
//!
//! A [`Storage`] client presents a uniform namespace/table/key/value
//! contract (setup, put, get, scan, delete, close) over an in-memory map,
//! a single persisted file, a remote in-memory cache, a relational
//! engine, a wide-column store, a distributed column-family store, or a
//! distributed document store. Which backend is active is resolved at
//! construction time from a [`StorageConfig`]'s `storage_type` setting;
//! every operation afterward has identical observable semantics
//! regardless of which one it is.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use polykv::{FieldSpec, FieldValue, KeySpec, Storage, StorageConfig};
//!
//! let config = StorageConfig::new()
//!     .set_str("storage_type", "local")
//!     .set_str("app_name", "demo")
//!     .set_str("namespace", "demo_ns");
//! let mut storage = Storage::open(&config).unwrap();
//!
//! let mut tables = HashMap::new();
//! tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
//! storage.setup_namespace(tables).unwrap();
//!
//! let key = vec![FieldValue::Int(1)];
//! storage.put("widgets", &[(key.clone(), b"hello".to_vec())]).unwrap();
//! let rows = storage.get("widgets", &[key]).unwrap();
//! assert_eq!(rows[0].1, Some(b"hello".to_vec()));
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod key;
pub mod registry;
pub mod storage;

pub use backend::Backend;
pub use config::{ConfigValue, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use key::{FieldSpec, FieldValue, Key, KeySpec};
pub use storage::Storage;
