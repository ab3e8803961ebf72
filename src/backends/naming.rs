//! Deterministic physical-table naming shared by the per-table backends
//! (spec.md §6's naming convention: `app + "_" + namespace + "_" + table`).

pub fn table_phys(app: &str, namespace: &str, table: &str) -> String {
    format!("{app}_{namespace}_{table}")
}
