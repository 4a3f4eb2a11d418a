//! Tests for basic table operations.
use chrono::NaiveDate;
use futures::TryStreamExt;
use uuid::Uuid;

use icetable::{IcebergError, IcebergTable, TableIdent, Warehouse, WarehouseConfig};
use icetable::manifest::{DataFile, DataFileFormat, ManifestEntryStatus};
use icetable::partition::{PartitionField, PartitionTransform};
use icetable::row::Row;
use icetable::schema::{Field, PrimitiveType, Schema, SchemaChange, SchemaUpdate};
use icetable::snapshot::SnapshotOperation;
use icetable::storage::IcebergPath;
use icetable::transaction::{AppendFilesOperation, OverwriteFilesOperation};
use icetable::value::Value;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn schema() -> Schema {
    Schema::new(0, vec![
        Field::new_primitive(1, "name", true, PrimitiveType::String),
        Field::new_primitive(2, "email", false, PrimitiveType::String),
        Field::new_primitive(3, "dob", false, PrimitiveType::Date),
    ])
}

fn user(name: &str, email: Option<&str>, dob: (i32, u32, u32)) -> Row {
    Row::new(vec![
        Some(Value::from(name)),
        email.map(Value::from),
        Some(Value::Date(NaiveDate::from_ymd_opt(dob.0, dob.1, dob.2).unwrap())),
    ])
}

async fn new_table() -> IcebergTable {
    init_tracing();
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).unwrap();
    warehouse.create_table(&TableIdent::of(["raw"], "users"), schema()).await.unwrap()
}

fn new_datafile(table: &IcebergTable, record_count: i64, file_size_in_bytes: i64) -> DataFile {
    DataFile::builder(
        &format!("{}/data/{}.parquet", table.location(), Uuid::new_v4()),
        DataFileFormat::Parquet,
        record_count,
        file_size_in_bytes
    ).build()
}

async fn rows(table: &IcebergTable) -> Vec<Row> {
    table.scan().build().unwrap().rows().await.unwrap().try_collect().await.unwrap()
}

#[tokio::test]
async fn append_operation() {
    let mut table = new_table().await;

    let datafile1 = new_datafile(&table, 1111, 10111);
    let datafile2 = new_datafile(&table, 2222, 20222);

    // Append two fake files in two operations, to create two manifests.
    let mut transaction = table.new_transaction();
    let mut op = AppendFilesOperation::new();
    op.append_file(datafile1);
    transaction.add_operation(Box::new(op));
    transaction.commit().await.unwrap();

    table.append_files(vec![datafile2]).await.unwrap();

    let snapshot = table.current_snapshot().unwrap().clone();
    let manifest_list = table.read_manifest_list(&snapshot).await.unwrap();
    let manifest_files = manifest_list.manifest_files();

    assert_eq!(manifest_files.len(), 2);

    assert_eq!(manifest_files[0].sequence_number, 1);
    assert_eq!(manifest_files[0].added_data_files_count, 1);
    assert_eq!(manifest_files[0].added_rows_count, 1111);
    assert_eq!(manifest_files[0].existing_data_files_count, 0);

    assert_eq!(manifest_files[1].sequence_number, 2);
    assert_eq!(manifest_files[1].added_data_files_count, 1);
    assert_eq!(manifest_files[1].added_rows_count, 2222);
    assert_eq!(manifest_files[1].existing_data_files_count, 0);
    assert_eq!(manifest_files[1].added_snapshot_id, snapshot.snapshot_id);

    assert_eq!(snapshot.summary.stat("total-data-files"), Some(2));
    assert_eq!(snapshot.summary.stat("total-files-size"), Some(30333));
}

#[tokio::test]
async fn overwrite_operation() {
    let mut table = new_table().await;

    let datafile1 = new_datafile(&table, 1111, 10111);
    let datafile2 = new_datafile(&table, 2222, 20222);
    let datafile3 = new_datafile(&table, 3333, 30333);

    table.append_files(vec![datafile1.clone()]).await.unwrap();
    table.append_files(vec![datafile2.clone()]).await.unwrap();
    let first_snapshot_id = table.snapshots()[0].snapshot_id;

    // Use an overwrite operation to replace the first data file
    let mut transaction = table.new_transaction();
    let mut op = OverwriteFilesOperation::new();
    op.delete_file(&datafile1.file_path);
    op.add_file(datafile3.clone());
    transaction.add_operation(Box::new(op));
    transaction.commit().await.unwrap();

    let snapshot = table.current_snapshot().unwrap().clone();
    assert_eq!(snapshot.operation(), SnapshotOperation::Overwrite);
    assert_eq!(snapshot.summary.stat("deleted-records"), Some(1111));
    assert_eq!(snapshot.summary.stat("total-records"), Some(2222 + 3333));

    let manifest_list = table.read_manifest_list(&snapshot).await.unwrap();
    let manifest_files = manifest_list.manifest_files();

    // The first manifest is rewritten, the second is reused and the third tracks
    // the added file.
    assert_eq!(manifest_files.len(), 3);

    assert_eq!(manifest_files[0].sequence_number, 3);
    assert_eq!(manifest_files[0].deleted_data_files_count, 1);
    assert_eq!(manifest_files[0].deleted_rows_count, 1111);
    assert!(!manifest_files[0].has_live_files());

    assert_eq!(manifest_files[1].sequence_number, 2);
    assert_eq!(manifest_files[1].added_rows_count, 2222);

    assert_eq!(manifest_files[2].sequence_number, 3);
    assert_eq!(manifest_files[2].added_rows_count, 3333);

    let manifest = table.read_manifest(&manifest_files[0]).await.unwrap();
    assert_eq!(manifest.entries().len(), 1);
    let entry = &manifest.entries()[0];
    assert_eq!(entry.status(), ManifestEntryStatus::Deleted);
    assert_eq!(entry.snapshot_id(), Some(snapshot.snapshot_id));
    assert_eq!(entry.sequence_number, Some(1));
    assert_eq!(entry.data_file(), &datafile1);

    let planned = table.scan().build().unwrap().plan_files().await.unwrap();
    assert_eq!(planned, vec![datafile2.clone(), datafile3]);

    // Time travel still sees the replaced file.
    let planned = table.scan().snapshot_id(first_snapshot_id).build().unwrap()
        .plan_files().await.unwrap();
    assert_eq!(planned, vec![datafile1]);
}

#[tokio::test]
async fn delete_operation() {
    let mut table = new_table().await;

    let datafile1 = new_datafile(&table, 10, 100);
    let datafile2 = new_datafile(&table, 20, 200);
    table.append_files(vec![datafile1.clone(), datafile2.clone()]).await.unwrap();

    table.delete_files(&[datafile1.file_path.as_str()]).await.unwrap();
    let snapshot = table.current_snapshot().unwrap().clone();
    assert_eq!(snapshot.operation(), SnapshotOperation::Delete);
    assert_eq!(snapshot.summary.stat("total-records"), Some(20));

    let manifest_list = table.read_manifest_list(&snapshot).await.unwrap();
    assert_eq!(manifest_list.len(), 1);
    let manifest = table.read_manifest(&manifest_list.manifest_files()[0]).await.unwrap();
    let statuses: Vec<_> = manifest.entries().iter().map(|e| e.status()).collect();
    assert_eq!(statuses, vec![ManifestEntryStatus::Deleted, ManifestEntryStatus::Existing]);

    // Deleting again fails: the file is no longer part of the table.
    let location = table.metadata_location().to_string();
    let result = table.delete_files(&[datafile1.file_path.as_str()]).await;
    assert!(matches!(result, Err(IcebergError::ValidationError { .. })));
    assert_eq!(table.metadata_location(), location);

    // Entries deleted by an earlier snapshot are dropped when the manifest is
    // rewritten again.
    table.delete_files(&[datafile2.file_path.as_str()]).await.unwrap();
    let snapshot = table.current_snapshot().unwrap().clone();
    let manifest_list = table.read_manifest_list(&snapshot).await.unwrap();
    let manifest = table.read_manifest(&manifest_list.manifest_files()[0]).await.unwrap();
    assert_eq!(manifest.entries().len(), 1);
    assert_eq!(manifest.entries()[0].data_file(), &datafile2);
    assert!(table.scan().build().unwrap().plan_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_rows_are_never_committed() {
    let mut table = new_table().await;

    let mut writer = table.new_writer().unwrap();
    let missing_name = Row::new(vec![None, Some(Value::from("a@b.c")), None]);
    assert!(matches!(writer.write(missing_name), Err(IcebergError::SchemaViolation { .. })));

    let wrong_type = Row::new(vec![Some(Value::from("x")), Some(Value::Int(3)), None]);
    assert!(matches!(writer.write(wrong_type), Err(IcebergError::SchemaViolation { .. })));

    let too_short = Row::new(vec![Some(Value::from("x"))]);
    assert!(matches!(writer.write(too_short), Err(IcebergError::SchemaViolation { .. })));

    assert!(writer.close().await.unwrap().is_empty());
    assert!(table.current_snapshot().is_none());

    let data_dir = table.table_path().unwrap().join("data");
    assert!(table.storage().list(&data_dir).await.unwrap().is_empty());

    writer.write(user("Valid User", None, (2000, 1, 1))).unwrap();
    writer.commit(&mut table).await.unwrap();
    assert_eq!(rows(&table).await, vec![user("Valid User", None, (2000, 1, 1))]);
}

#[tokio::test]
async fn schema_evolution_reads() {
    let mut table = new_table().await;

    let mut writer = table.new_writer().unwrap();
    writer.write(user("John Smith", Some("smith.john@gmail.com"), (1996, 11, 25))).unwrap();
    writer.commit(&mut table).await.unwrap();
    let first_snapshot_id = table.current_snapshot().unwrap().snapshot_id;

    table.update_schema(SchemaUpdate::new([
        SchemaChange::add_column("age", PrimitiveType::Int),
        SchemaChange::rename_column("email", "contact"),
    ])).await.unwrap();

    let schema = table.current_schema().unwrap().clone();
    assert_eq!(schema.id(), 1);
    assert_eq!(schema.field_by_name("contact").unwrap().id(), 2);
    assert_eq!(schema.field_by_name("age").unwrap().id(), 4);

    let mut writer = table.new_writer().unwrap();
    writer.write(Row::new(vec![
        Some(Value::from("Eyasu Kiflay")),
        Some(Value::from("eyasu@gmail.com")),
        None,
        Some(Value::Int(27)),
    ])).unwrap();
    writer.commit(&mut table).await.unwrap();

    table.update_schema(SchemaUpdate::new([
        SchemaChange::promote_type("age", PrimitiveType::Long),
    ])).await.unwrap();

    let scan = table.scan().select(["name", "contact", "age"]).build().unwrap();
    let rows: Vec<Row> = scan.rows().await.unwrap().try_collect().await.unwrap();
    assert_eq!(rows, vec![
        Row::new(vec![
            Some(Value::from("John Smith")),
            Some(Value::from("smith.john@gmail.com")),
            None,
        ]),
        Row::new(vec![
            Some(Value::from("Eyasu Kiflay")),
            Some(Value::from("eyasu@gmail.com")),
            Some(Value::Long(27)),
        ]),
    ]);

    // The first snapshot is read with the schema it was written with.
    let scan = table.scan().snapshot_id(first_snapshot_id).build().unwrap();
    let names: Vec<&str> = scan.fields().iter().map(|f| f.name()).collect();
    assert_eq!(names, vec!["name", "email", "dob"]);

    let narrowing = table.update_schema(SchemaUpdate::new([
        SchemaChange::promote_type("age", PrimitiveType::Int),
    ])).await;
    assert!(matches!(narrowing, Err(IcebergError::SchemaError { .. })));
}

#[tokio::test]
async fn partitioned_writes() {
    let mut table = new_table().await;

    table.update_partition_spec(vec![
        PartitionField::new(3, 1000, "dob_year", PartitionTransform::Year),
    ]).await.unwrap();
    assert_eq!(table.current_partition_spec().unwrap().spec_id(), 1);

    let users = vec![
        user("Habtom Berhe", None, (1996, 12, 5)),
        user("Semhar  Tedros", None, (1997, 1, 9)),
        user("John Smith", None, (1996, 11, 25)),
    ];
    let mut writer = table.new_writer().unwrap();
    writer.write_all(users.clone()).unwrap();
    writer.commit(&mut table).await.unwrap();

    let mut data_files = table.scan().build().unwrap().plan_files().await.unwrap();
    data_files.sort_by_key(|f| f.record_count);
    assert_eq!(data_files.len(), 2);
    assert_eq!(data_files[0].partition.get("dob_year"), Some(&Value::Int(27)));
    assert_eq!(data_files[1].partition.get("dob_year"), Some(&Value::Int(26)));
    assert!(data_files[1].file_path.contains("/data/dob_year=26/"));

    let mut scanned = rows(&table).await;
    let mut expected = users;
    let name = |row: &Row| row.get(0).cloned();
    scanned.sort_by(|a, b| name(a).partial_cmp(&name(b)).unwrap());
    expected.sort_by(|a, b| name(a).partial_cmp(&name(b)).unwrap());
    assert_eq!(scanned, expected);
}

#[tokio::test]
async fn data_paths_stay_in_the_table() {
    let table = new_table().await;
    let path = table.table_path().unwrap();
    assert_eq!(path, IcebergPath::from("raw/users"));
    assert_eq!(table.metadata_file_location("x.avro"), format!("{}/metadata/x.avro", table.location()));
}
