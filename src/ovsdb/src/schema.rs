//! An in-memory mirror of the subset of each database's tables the
//! harness reads directly (`NB_Global`, `Connection`, `Chassis`), kept
//! current by replaying `monitor` update notifications. Everything else
//! the harness creates is addressed purely by the UUID the create call
//! itself returned, so the general row tables are not modeled here.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;
use uuid::Uuid;

/// One table's mirrored rows, keyed by row UUID.
#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<Uuid, Value>,
}

/// The monitored replica of a database's schema. `NB_Global` and
/// `Connection` are singleton tables in OVSDB (exactly one row); the
/// harness reads them through `singleton_row`, mirroring
/// `NBIdl._nb`/`_connection` (`next(iter(self.db_list_rows(...).execute()))`).
#[derive(Debug, Default)]
pub struct Monitor {
    tables: RwLock<BTreeMap<String, Table>>,
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor::default()
    }

    /// Applies one `<row-uuid>: <new-or-null-row>` update from a
    /// `monitor`/`update` notification. A `None` new value means the row
    /// was deleted.
    pub fn apply_update(&self, table: &str, row: Uuid, new_value: Option<Value>) {
        let mut tables = self.tables.write().unwrap();
        let entry = tables.entry(table.to_string()).or_default();
        match new_value {
            Some(v) => {
                entry.rows.insert(row, v);
            }
            None => {
                entry.rows.remove(&row);
            }
        }
    }

    /// Reads the single row of a singleton table, along with its UUID.
    pub fn singleton_row(&self, table: &str) -> Option<(Uuid, Value)> {
        let tables = self.tables.read().unwrap();
        let t = tables.get(table)?;
        t.rows.iter().next().map(|(uuid, v)| (*uuid, v.clone()))
    }

    /// Finds a row in `table` whose column `key` equals `value`, as
    /// `db_find_rows` does for `Chassis.name`.
    pub fn find_row(&self, table: &str, key: &str, value: &str) -> Option<(Uuid, Value)> {
        let tables = self.tables.read().unwrap();
        let t = tables.get(table)?;
        t.rows.iter().find(|(_, row)| row.get(key).and_then(Value::as_str) == Some(value)).map(|(uuid, v)| (*uuid, v.clone()))
    }

    /// Finds a row in `table` whose `external_ids[id_key]` equals `value`,
    /// for tables (ACL, NAT, static routes, gateway chassis) that have no
    /// natural `name` column of their own and so stash their dedup key in
    /// `external_ids`, the way `ovn_utils.py` tags rows it needs to find
    /// again by something other than a UUID it already has in hand.
    pub fn find_row_by_external_id(&self, table: &str, id_key: &str, value: &str) -> Option<(Uuid, Value)> {
        let tables = self.tables.read().unwrap();
        let t = tables.get(table)?;
        t.rows
            .iter()
            .find(|(_, row)| row.get("external_ids").and_then(|ids| ids.get(id_key)).and_then(Value::as_str) == Some(value))
            .map(|(uuid, v)| (*uuid, v.clone()))
    }

    /// Reads a numeric column off a specific row, used for `sb_cfg`/`hv_cfg`
    /// polling.
    pub fn column_u64(&self, table: &str, row: Uuid, column: &str) -> Option<u64> {
        let tables = self.tables.read().unwrap();
        tables.get(table)?.rows.get(&row)?.get(column)?.as_u64()
    }

    /// Reads an arbitrary column off a specific row, used by read-modify-write
    /// mutations (e.g. merging into `Load_Balancer.vips`) that need the
    /// current value before computing the update.
    pub fn column(&self, table: &str, row: Uuid, column: &str) -> Option<Value> {
        let tables = self.tables.read().unwrap();
        tables.get(table)?.rows.get(&row)?.get(column).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn singleton_row_reads_back_applied_update() {
        let monitor = Monitor::new();
        let id = Uuid::new_v4();
        monitor.apply_update("NB_Global", id, Some(json!({"nb_cfg": 3, "sb_cfg": 2})));
        let (found_id, row) = monitor.singleton_row("NB_Global").unwrap();
        assert_eq!(found_id, id);
        assert_eq!(row["nb_cfg"], 3);
    }

    #[test]
    fn deleted_row_disappears() {
        let monitor = Monitor::new();
        let id = Uuid::new_v4();
        monitor.apply_update("Chassis", id, Some(json!({"name": "worker-1"})));
        monitor.apply_update("Chassis", id, None);
        assert!(monitor.find_row("Chassis", "name", "worker-1").is_none());
    }

    #[test]
    fn find_row_matches_on_column() {
        let monitor = Monitor::new();
        let id = Uuid::new_v4();
        monitor.apply_update("Chassis", id, Some(json!({"name": "worker-1"})));
        let (found, _) = monitor.find_row("Chassis", "name", "worker-1").unwrap();
        assert_eq!(found, id);
    }

    #[test]
    fn find_row_by_external_id_matches_nested_key() {
        let monitor = Monitor::new();
        let id = Uuid::new_v4();
        monitor.apply_update("NAT", id, Some(json!({"type": "snat", "external_ids": {"oh-key": "lr0-1.2.3.4-10.0.0.1"}})));
        let (found, _) = monitor.find_row_by_external_id("NAT", "oh-key", "lr0-1.2.3.4-10.0.0.1").unwrap();
        assert_eq!(found, id);
    }
}
