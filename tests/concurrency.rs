//! Tests for concurrent writers racing on the same table.
use std::collections::HashSet;

use uuid::Uuid;

use icetable::{CatalogKind, IcebergError, IcebergTable, TableIdent, Warehouse, WarehouseConfig};
use icetable::manifest::{DataFile, DataFileFormat};
use icetable::schema::{Field, PrimitiveType, Schema};
use icetable::transaction::AppendFilesOperation;

fn schema() -> Schema {
    Schema::new(0, vec![
        Field::new_primitive(1, "id", true, PrimitiveType::Long),
        Field::new_primitive(2, "name", false, PrimitiveType::String),
    ])
}

fn ident() -> TableIdent {
    TableIdent::of(["raw"], "events")
}

fn new_datafile(table: &IcebergTable, record_count: i64) -> DataFile {
    DataFile::builder(
        &format!("{}/data/{}.parquet", table.location(), Uuid::new_v4()),
        DataFileFormat::Parquet,
        record_count,
        record_count * 100
    ).build()
}

/// Commits one fake data file, with the given number of retries.
async fn append(table: &mut IcebergTable, record_count: i64, retries: u32) -> Result<(), IcebergError> {
    let mut op = AppendFilesOperation::new();
    op.append_file(new_datafile(table, record_count));

    let mut transaction = table.new_transaction().with_retries(retries);
    transaction.add_operation(Box::new(op));
    transaction.commit().await
}

#[tokio::test]
async fn loser_retries_on_top_of_winner() {
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).unwrap();
    let mut setup = warehouse.create_table(&ident(), schema()).await.unwrap();
    append(&mut setup, 5, 0).await.unwrap();
    let snapshot_a = setup.current_snapshot().unwrap().snapshot_id;

    // Both writers read base metadata at snapshot A.
    let mut writer1 = warehouse.load_table(&ident()).await.unwrap();
    let mut writer2 = warehouse.load_table(&ident()).await.unwrap();

    append(&mut writer1, 1, 0).await.unwrap();
    let winner = writer1.current_snapshot().unwrap().clone();
    assert_eq!(winner.parent_snapshot_id, Some(snapshot_a));

    append(&mut writer2, 2, 3).await.unwrap();
    let retried = writer2.current_snapshot().unwrap().clone();
    assert_eq!(retried.parent_snapshot_id, Some(winner.snapshot_id));
    assert_eq!(retried.sequence_number, winner.sequence_number + 1);
    assert_eq!(retried.summary.stat("total-records"), Some(8));

    let current = warehouse.load_table(&ident()).await.unwrap();
    assert_eq!(current.metadata_location(), writer2.metadata_location());
    assert_eq!(current.snapshots().len(), 3);
}

#[tokio::test]
async fn loser_without_retries_fails_cleanly() {
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).unwrap();
    let mut setup = warehouse.create_table(&ident(), schema()).await.unwrap();
    append(&mut setup, 5, 0).await.unwrap();

    let mut writer1 = warehouse.load_table(&ident()).await.unwrap();
    let mut writer2 = warehouse.load_table(&ident()).await.unwrap();

    append(&mut writer1, 1, 0).await.unwrap();
    let result = append(&mut writer2, 2, 0).await;
    assert!(matches!(result, Err(IcebergError::CommitFailed { attempts: 1, .. })));

    // The table is left at the winner's state and the loser's handle is not advanced.
    let current = warehouse.load_table(&ident()).await.unwrap();
    assert_eq!(current.metadata_location(), writer1.metadata_location());
    assert_eq!(current.current_snapshot().unwrap().summary.stat("total-records"), Some(6));
    assert_ne!(writer2.metadata_location(), writer1.metadata_location());
}

#[tokio::test]
async fn concurrent_appends_form_a_linear_history() {
    const WRITERS: usize = 6;

    let warehouse = Warehouse::open(
        WarehouseConfig::in_memory().with_commit_retries(WRITERS as u32)
    ).unwrap();
    warehouse.create_table(&ident(), schema()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        let warehouse = warehouse.clone();
        tasks.push(tokio::spawn(async move {
            let mut table = warehouse.load_table(&ident()).await?;
            let mut op = AppendFilesOperation::new();
            op.append_file(new_datafile(&table, i as i64 + 1));

            let mut transaction = table.new_transaction();
            transaction.add_operation(Box::new(op));
            transaction.commit().await?;
            Ok::<_, IcebergError>(table.snapshots().len())
        }));
    }
    let mut seen = HashSet::new();
    for task in tasks {
        // Each writer committed a different position in the history.
        assert!(seen.insert(task.await.unwrap().unwrap()));
    }

    let table = warehouse.load_table(&ident()).await.unwrap();
    let snapshots = table.snapshots();
    assert_eq!(snapshots.len(), WRITERS);

    let mut parent = None;
    for (i, snapshot) in snapshots.iter().enumerate() {
        assert_eq!(snapshot.parent_snapshot_id, parent);
        assert_eq!(snapshot.sequence_number, i as i64 + 1);
        parent = Some(snapshot.snapshot_id);
    }

    let ids: HashSet<i64> = snapshots.iter().map(|s| s.snapshot_id).collect();
    assert_eq!(ids.len(), WRITERS);

    let total: i64 = (1..=WRITERS as i64).sum();
    assert_eq!(table.current_snapshot().unwrap().summary.stat("total-records"), Some(total));

    let data_files = table.scan().build().unwrap().plan_files().await.unwrap();
    assert_eq!(data_files.len(), WRITERS);
}

#[tokio::test]
async fn storage_catalog_race_across_warehouses() {
    let dir = tempfile::tempdir().unwrap();
    let config = WarehouseConfig::new(&format!("file://{}", dir.path().display()))
        .with_catalog(CatalogKind::Storage);

    let warehouse1 = Warehouse::open(config.clone()).unwrap();
    let warehouse2 = Warehouse::open(config).unwrap();
    warehouse1.create_table(&ident(), schema()).await.unwrap();

    let mut writer1 = warehouse1.load_table(&ident()).await.unwrap();
    let mut writer2 = warehouse2.load_table(&ident()).await.unwrap();

    append(&mut writer1, 1, 0).await.unwrap();
    assert!(append(&mut writer2, 2, 0).await.is_err());

    writer2.refresh().await.unwrap();
    assert_eq!(writer2.metadata_location(), writer1.metadata_location());
    append(&mut writer2, 2, 0).await.unwrap();

    let table = warehouse1.load_table(&ident()).await.unwrap();
    assert_eq!(table.snapshots().len(), 2);
    assert_eq!(table.current_snapshot().unwrap().summary.stat("total-records"), Some(3));
}
