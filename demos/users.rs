use chrono::NaiveDate;
use futures::TryStreamExt;
use tracing::info;

use icetable::{CatalogKind, IcebergResult, TableIdent, Warehouse, WarehouseConfig};
use icetable::row::Row;
use icetable::schema::{Field, PrimitiveType, Schema};

static DEFAULT_WAREHOUSE_URL: &str = "file:///tmp/iceberg/warehouse";

const USERS: [(&str, &str, &str); 5] = [
    ("Habtom Berhe", "habtomberhe@gmail.com", "1996-12-05"),
    ("John Smith", "smith.john@gmail.com", "1996-11-25"),
    ("Semhar  Tedros", "semhar.tedros@gmail.com", "1997-01-09"),
    ("Fishale Gebrehiwet", "fishgebre@gmail.com", "1998-10-03"),
    ("Eyasu Kiflay", "eyasu@gmail.com", "1998-11-04"),
];

#[tokio::main]
async fn main() -> IcebergResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .init();

    let config = match WarehouseConfig::from_env() {
        Ok(config) => config,
        Err(_) => {
            let url = std::env::args().nth(1).unwrap_or(DEFAULT_WAREHOUSE_URL.to_string());
            WarehouseConfig::new(&url).with_catalog(CatalogKind::Storage)
        }
    };
    let warehouse = Warehouse::open(config)?;

    let schema = Schema::new(0, vec![
        Field::new_primitive(1, "name", true, PrimitiveType::String),
        Field::new_primitive(2, "email", false, PrimitiveType::String),
        Field::new_primitive(3, "dob", false, PrimitiveType::Date),
    ]);

    let ident = TableIdent::of(["raw"], "users");
    let mut table = match warehouse.load_table(&ident).await {
        Ok(table) => table,
        Err(e) if e.is_not_found() => warehouse.create_table(&ident, schema).await?,
        Err(e) => return Err(e),
    };

    let mut writer = table.new_writer()?;
    for (name, email, dob) in USERS {
        let dob = NaiveDate::parse_from_str(dob, "%Y-%m-%d").map_err(|e| {
            icetable::IcebergError::ValueError(format!("invalid date {dob}: {e}"))
        })?;
        let row = Row::builder(writer.schema())
            .set("name", name)?
            .set("email", email)?
            .set("dob", dob)?
            .build();
        writer.write(row)?;
    }
    writer.commit(&mut table).await?;

    let scan = table.scan().build()?;
    let rows: Vec<Row> = scan.rows().await?.try_collect().await?;
    for row in &rows {
        info!(?row, "read row");
    }

    println!(
        "Committed {} users to {}, the table now holds {} rows",
        USERS.len(),
        table.location(),
        rows.len()
    );

    Ok(())
}
