//! Integration tests for the relforge-sqlite crate.

use std::path::{Path, PathBuf};

use relforge_core::{
    CandidateRelation, DiscoveryConfig, EngineConfig, OverlapMode, TRACKING_COLUMN,
};
use relforge_sqlite::{
    Database, EngineError, RebuildStep, RelationDiscovery, TableRebuilder, api, introspect,
};
use rusqlite::Connection;
use tempfile::TempDir;

/// Creates a database file in `dir` from a batch of SQL.
fn create_db(dir: &TempDir, name: &str, sql: &str) -> PathBuf {
    let path = dir.path().join(name);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(sql).unwrap();
    path
}

/// The customers/orders pair used throughout.
fn shop_db(dir: &TempDir) -> PathBuf {
    create_db(
        dir,
        "shop.db",
        "CREATE TABLE customers (id INTEGER, name TEXT);
         CREATE TABLE orders (id INTEGER, customer_id INTEGER, total REAL);
         INSERT INTO customers VALUES (1, 'ada'), (2, 'bob');
         INSERT INTO orders VALUES (10, 1, 9.5), (11, 2, 20.0), (12, 2, 3.25);",
    )
}

fn column_names(path: &Path, table: &str) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    introspect::table_columns(&conn, table)
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect()
}

fn query_pairs(path: &Path, sql: &str) -> Vec<(i64, i64)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

// =============================================================================
// Discovery
// =============================================================================

#[test]
fn test_discovery_finds_customer_relation() {
    let dir = tempfile::tempdir().unwrap();
    let path = shop_db(&dir);

    let relations = api::discover_candidate_relations(&path).unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].source_table, "orders");
    assert_eq!(relations[0].source_column, "customer_id");
    assert_eq!(relations[0].target_table, "customers");
    assert_eq!(relations[0].target_id_column, "id");
    assert_eq!(relations[0].data_overlap, 100.0);
}

#[test]
fn test_discovery_is_repeatable_and_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = shop_db(&dir);
    let before = api::table_summaries(&path).unwrap();

    let first = api::discover_candidate_relations(&path).unwrap();
    let second = api::discover_candidate_relations(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(api::table_summaries(&path).unwrap(), before);
    assert_eq!(column_names(&path, "orders"), vec!["id", "customer_id", "total"]);
}

#[test]
fn test_discovery_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(
        &dir,
        "partial.db",
        "CREATE TABLE phases (id INTEGER, label TEXT);
         CREATE TABLE tasks (id INTEGER, phase INTEGER);
         INSERT INTO phases VALUES (1, 'plan'), (2, 'build'), (4, 'ship');
         INSERT INTO tasks VALUES (1, 1), (2, 2), (3, 7);",
    );
    assert!(api::discover_candidate_relations(&path).unwrap().is_empty());

    let config_path = dir.path().join("relforge.yml");
    let mut config = EngineConfig::default();
    config.discovery.overlap = OverlapMode::AtLeast { percent: 50.0 };
    config.save(&config_path).unwrap();

    let loaded = EngineConfig::load(&config_path).unwrap();
    let relations = api::discover_candidate_relations_with_config(&path, &loaded).unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].source_column, "phase");
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = shop_db(&dir);
    let mut config = EngineConfig::default();
    config.discovery.name_threshold = 1.5;
    assert!(matches!(
        api::discover_candidate_relations_with_config(&path, &config),
        Err(EngineError::Config(_))
    ));
}

// =============================================================================
// Normalization
// =============================================================================

#[test]
fn test_normalize_materializes_discovered_relation() {
    let dir = tempfile::tempdir().unwrap();
    let path = shop_db(&dir);

    let relations = api::discover_candidate_relations(&path).unwrap();
    let report = api::normalize_and_materialize_relations(&path, &relations).unwrap();
    assert_eq!(report.materialized.len(), 1);
    assert!(report.skipped.is_empty());

    assert_eq!(
        column_names(&path, "orders"),
        vec!["orders_id", "total", TRACKING_COLUMN, "customers_id"]
    );
    assert_eq!(column_names(&path, "customers")[0], "customers_id");

    let conn = Connection::open(&path).unwrap();
    let keys = introspect::foreign_keys(&conn, "orders").unwrap();
    assert!(keys.iter().any(|k| k.column == "customers_id"
        && k.target_table == "customers"
        && k.target_column.as_deref() == Some("customers_id")));

    let declared: String = conn
        .query_row(
            "SELECT type FROM pragma_table_info('orders') WHERE name = 'customers_id'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(declared, "INTEGER");

    assert_eq!(
        query_pairs(&path, "SELECT orders_id, customers_id FROM orders ORDER BY orders_id"),
        vec![(10, 1), (11, 2), (12, 2)]
    );
    let totals: f64 = conn
        .query_row("SELECT SUM(total) FROM orders", [], |row| row.get(0))
        .unwrap();
    assert_eq!(totals, 32.75);
}

#[test]
fn test_normalize_renames_id_to_sole_primary_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(
        &dir,
        "orders.db",
        "CREATE TABLE orders (id INTEGER, label TEXT);
         INSERT INTO orders VALUES (1, 'a'), (2, 'b');",
    );
    api::normalize_and_materialize_relations(&path, &[]).unwrap();

    let conn = Connection::open(&path).unwrap();
    let columns = introspect::table_columns(&conn, "orders").unwrap();
    let keys = introspect::primary_key_columns(&columns);
    assert_eq!(keys, vec!["orders_id"]);
    assert_eq!(
        query_pairs(&path, "SELECT orders_id, length(label) FROM orders ORDER BY 1"),
        vec![(1, 1), (2, 1)]
    );
    let project_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM ProjectInformation", [], |row| row.get(0))
        .unwrap();
    assert_eq!(project_rows, 1);
}

#[test]
fn test_normalize_rejects_invalid_relations() {
    let dir = tempfile::tempdir().unwrap();
    let path = shop_db(&dir);
    let bogus = CandidateRelation::new("orders", "customer_id", "orders", "id");
    let report = api::normalize_and_materialize_relations(&path, &[bogus]).unwrap();
    assert!(report.materialized.is_empty());
    assert!(column_names(&path, "orders").contains(&"customer_id".to_string()));
}

#[test]
fn test_normalize_keeps_unique_check_and_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(
        &dir,
        "users.db",
        "CREATE TABLE users (id INTEGER, email TEXT UNIQUE, age INTEGER CHECK (age > 0));
         CREATE TABLE audit (note TEXT);
         CREATE TRIGGER users_audit AFTER INSERT ON users
         BEGIN INSERT INTO audit (note) VALUES (NEW.email); END;
         INSERT INTO users VALUES (1, 'a@x', 30);",
    );
    api::normalize_and_materialize_relations(&path, &[]).unwrap();
    assert!(column_names(&path, "users").contains(&"users_id".to_string()));

    let conn = Connection::open(&path).unwrap();
    assert!(
        conn.execute("INSERT INTO users (users_id, email, age) VALUES (2, 'a@x', 20)", [])
            .is_err()
    );
    assert!(
        conn.execute("INSERT INTO users (users_id, email, age) VALUES (3, 'c@x', -1)", [])
            .is_err()
    );
    conn.execute("INSERT INTO users (users_id, email, age) VALUES (4, 'd@x', 40)", [])
        .unwrap();
    let audited: i64 = conn
        .query_row("SELECT COUNT(*) FROM audit WHERE note = 'd@x'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(audited, 1);
}

// =============================================================================
// Rebuild
// =============================================================================

#[test]
fn test_rebuild_failure_leaves_table_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = shop_db(&dir);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE orders_clash (x INTEGER);").unwrap();
    drop(conn);

    let db = Database::open(&path).unwrap();
    let rebuilder = TableRebuilder::new(&db).with_temp_name("orders_clash");
    let mut plan = rebuilder.plan("orders").unwrap();
    plan.rename_column("id", "orders_id");
    plan.set_primary_key(&["orders_id"]);

    let err = rebuilder.rebuild(&plan).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Rebuild {
            step: RebuildStep::CreateTemp,
            ..
        }
    ));
    drop(db);

    assert_eq!(column_names(&path, "orders"), vec!["id", "customer_id", "total"]);
    let summaries = api::table_summaries(&path).unwrap();
    let orders = summaries.iter().find(|s| s.name == "orders").unwrap();
    assert_eq!(orders.row_count, 3);
}

// =============================================================================
// Merge
// =============================================================================

fn project_db(dir: &TempDir, name: &str, project: &str, item: (i64, &str)) -> PathBuf {
    let path = create_db(
        dir,
        name,
        "CREATE TABLE ProjectInformation (
             ProjectInformation_id INTEGER PRIMARY KEY AUTOINCREMENT,
             ProjectName TEXT
         );
         CREATE TABLE items (items_id INTEGER PRIMARY KEY, name TEXT, ProjectInformation_id INTEGER);",
    );
    let conn = Connection::open(&path).unwrap();
    conn.execute(
        "INSERT INTO ProjectInformation VALUES (1, ?1)",
        rusqlite::params![project],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO items VALUES (?1, ?2, 1)",
        rusqlite::params![item.0, item.1],
    )
    .unwrap();
    path
}

#[test]
fn test_merge_assigns_distinct_project_ids() {
    let dir = tempfile::tempdir().unwrap();
    let source = project_db(&dir, "source.db", "incoming", (50, "from source"));
    let target = project_db(&dir, "target.db", "home", (1, "from target"));

    assert!(api::merge_databases(&source, &target));

    assert_eq!(
        query_pairs(
            &target,
            "SELECT ProjectInformation_id, length(ProjectName) FROM ProjectInformation ORDER BY 1"
        ),
        vec![(1, 4), (2, 8)]
    );
    assert_eq!(
        query_pairs(
            &target,
            "SELECT items_id, ProjectInformation_id FROM items ORDER BY items_id"
        ),
        vec![(1, 1), (50, 2)]
    );
    let target_name: String = Connection::open(&target)
        .unwrap()
        .query_row("SELECT name FROM items WHERE items_id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(target_name, "from target");
}

#[test]
fn test_merge_report_and_new_tables() {
    let dir = tempfile::tempdir().unwrap();
    let source = project_db(&dir, "source.db", "incoming", (1, "dup key"));
    Connection::open(&source)
        .unwrap()
        .execute_batch(
            "CREATE TABLE notes (notes_id INTEGER PRIMARY KEY, body TEXT, ProjectInformation_id INTEGER);
             CREATE INDEX idx_notes_body ON notes (body);
             INSERT INTO notes VALUES (1, 'n', 1);",
        )
        .unwrap();
    let target = project_db(&dir, "target.db", "home", (1, "kept"));

    let report =
        api::merge_databases_with_config(&source, &target, &EngineConfig::default()).unwrap();
    assert_eq!(report.source, "source");
    assert_eq!(report.target, "target");
    assert_eq!(report.tables_created, vec!["notes"]);
    assert_eq!(report.tables_merged, vec!["items"]);
    assert_eq!(report.rows.inserted, 1);
    assert_eq!(report.rows.ignored, 1);
    assert_eq!(report.id_mapping.get(1), Some(2));
    assert!(report.skipped.is_empty());

    assert_eq!(
        query_pairs(&target, "SELECT notes_id, ProjectInformation_id FROM notes"),
        vec![(1, 2)]
    );
    let conn = Connection::open(&target).unwrap();
    assert_eq!(introspect::index_statements(&conn, "notes").unwrap().len(), 1);
}

#[test]
fn test_merge_respects_unique_columns_after_normalization() {
    let dir = tempfile::tempdir().unwrap();
    let target = project_db(&dir, "target.db", "home", (1, "kept"));
    Connection::open(&target)
        .unwrap()
        .execute_batch(
            "CREATE TABLE tags (id INTEGER, label TEXT UNIQUE);
             INSERT INTO tags VALUES (1, 'red');",
        )
        .unwrap();
    api::normalize_and_materialize_relations(&target, &[]).unwrap();

    let source = project_db(&dir, "source.db", "incoming", (5, "other"));
    Connection::open(&source)
        .unwrap()
        .execute_batch(
            "CREATE TABLE tags (id INTEGER, label TEXT UNIQUE);
             INSERT INTO tags VALUES (7, 'red'), (8, 'blue');",
        )
        .unwrap();
    assert!(api::merge_databases(&source, &target));

    let conn = Connection::open(&target).unwrap();
    let count = |label: &str| -> i64 {
        conn.query_row("SELECT COUNT(*) FROM tags WHERE label = ?1", [label], |row| row.get(0))
            .unwrap()
    };
    assert_eq!(count("red"), 1);
    assert_eq!(count("blue"), 1);
}

#[test]
fn test_merge_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let target = project_db(&dir, "target.db", "home", (1, "x"));
    let missing = dir.path().join("nope").join("source.db");
    assert!(!api::merge_databases(&missing, &target));
}

// =============================================================================
// Cleanup
// =============================================================================

#[test]
fn test_cleanup_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_db(
        &dir,
        "messy.db",
        "CREATE TABLE empty_one (a TEXT);
         CREATE TABLE records (records_id INTEGER PRIMARY KEY, keep TEXT, unused TEXT);
         INSERT INTO records VALUES (1, 'x', NULL), (2, 'y', '');",
    );
    let report = api::cleanup_database(&path).unwrap();
    assert_eq!(report.tables_dropped, vec!["empty_one"]);
    assert_eq!(report.columns_dropped, vec!["records.unused"]);
    assert_eq!(column_names(&path, "records"), vec!["records_id", "keep"]);
}

#[test]
fn test_discovery_over_in_memory_database() {
    let db = Database::open_in_memory().unwrap();
    db.connection()
        .execute_batch(
            "CREATE TABLE regions (id INTEGER, name TEXT);
             CREATE TABLE stores (id INTEGER, region_id INTEGER);
             INSERT INTO regions VALUES (1, 'n'), (2, 's');
             INSERT INTO stores VALUES (1, 1), (2, 1), (3, 2);",
        )
        .unwrap();
    let found = RelationDiscovery::new(&db, DiscoveryConfig::default())
        .discover()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].target_table, "regions");
}
