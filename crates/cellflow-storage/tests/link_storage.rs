//! Link key storage in its three physical layouts.

use cellflow_core::link::{fk_column, ID_COLUMN};
use cellflow_core::{Field, FieldId, LinkDbConfig, RecordId, Relationship, Table, TableId};
use cellflow_storage::{RecordStore, SqliteStore, StorageError};

fn fid(c: char) -> FieldId {
    FieldId::parse(format!("fld{}", c.to_string().repeat(16))).unwrap()
}

fn rid(c: char) -> RecordId {
    RecordId::parse(format!("rec{}", c.to_string().repeat(16))).unwrap()
}

/// Hosts and foreigns with one record each of `A`, `B`, `C`.
fn setup() -> (SqliteStore, Table, Table) {
    let mut store = SqliteStore::in_memory().unwrap();
    let mut foreign = Table::new("Foreign").with_id(TableId::parse("tblFFFFFFFFFFFFFFFF").unwrap());
    foreign.fields.push(Field::text("Name").with_id(fid('N')).primary());
    let mut host = Table::new("Host").with_id(TableId::parse("tblHHHHHHHHHHHHHHHH").unwrap());
    host.fields.push(
        Field::link("Link", Relationship::ManyOne, foreign.id.clone(), fid('N')).with_id(fid('L')),
    );
    for table in [&foreign, &host] {
        store.create_table_storage(table).unwrap();
        for c in ['A', 'B', 'C'] {
            store.insert_record(table, &rid(c)).unwrap();
        }
    }
    (store, host, foreign)
}

#[test]
fn key_on_host_row_holds_one_link() {
    let (mut store, host, _) = setup();
    let db = LinkDbConfig {
        fk_host_table_name: host.db_table_name().to_string(),
        self_key_name: ID_COLUMN.to_string(),
        foreign_key_name: fk_column(&fid('L')),
    };
    store.add_column(&db.fk_host_table_name, &db.foreign_key_name).unwrap();
    // Adding twice is harmless.
    store.add_column(&db.fk_host_table_name, &db.foreign_key_name).unwrap();

    store.set_links(&db, &rid('A'), &[rid('B')]).unwrap();
    store.set_links(&db, &rid('C'), &[rid('B')]).unwrap();
    assert_eq!(store.linked_record_ids(&db, &rid('A')).unwrap(), vec![rid('B')]);

    let mut hosts = store.hosts_linking_to(&db, &[rid('B')]).unwrap();
    hosts.sort();
    assert_eq!(hosts, vec![rid('A'), rid('C')]);

    let err = store.set_links(&db, &rid('A'), &[rid('B'), rid('C')]);
    assert!(matches!(err, Err(StorageError::IntegrityError { .. })));

    store.set_links(&db, &rid('A'), &[]).unwrap();
    assert!(store.linked_record_ids(&db, &rid('A')).unwrap().is_empty());
}

#[test]
fn key_on_foreign_rows_moves_with_the_host() {
    let (mut store, _, foreign) = setup();
    let db = LinkDbConfig {
        fk_host_table_name: foreign.db_table_name().to_string(),
        self_key_name: fk_column(&fid('S')),
        foreign_key_name: ID_COLUMN.to_string(),
    };
    store.add_column(&db.fk_host_table_name, &db.self_key_name).unwrap();

    store.set_links(&db, &rid('A'), &[rid('A'), rid('B')]).unwrap();
    store.set_links(&db, &rid('C'), &[rid('C')]).unwrap();
    let mut linked = store.linked_record_ids(&db, &rid('A')).unwrap();
    linked.sort();
    assert_eq!(linked, vec![rid('A'), rid('B')]);

    // Re-pointing a foreign record detaches it from its previous host.
    store.set_links(&db, &rid('C'), &[rid('B'), rid('C')]).unwrap();
    assert_eq!(store.linked_record_ids(&db, &rid('A')).unwrap(), vec![rid('A')]);
    assert_eq!(store.hosts_linking_to(&db, &[rid('B')]).unwrap(), vec![rid('C')]);
}

#[test]
fn dropping_a_missing_column_is_a_no_op() {
    let (mut store, host, _) = setup();
    store.drop_column(host.db_table_name(), "__fk_missing").unwrap();
    store.add_column(host.db_table_name(), "extra").unwrap();
    store.drop_column(host.db_table_name(), "extra").unwrap();
}
