//! Source database contracts: per-period table naming plus MySQL and
//! fixture-backed readers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use ptdc_core::{
    ColumnValue, ExtraColumns, Period, SourceBill, SourceBillItem, StockCategory, StockProduct,
};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ptdc-source";

pub const STOCK_CATEGORY_TABLE: &str = "stock_category";
pub const STOCK_PRODUCT_TABLE: &str = "stock_product";

/// Columns read from `bill_items_201Y_M`; anything else in the source is ignored.
pub const BILL_ITEM_PROJECTION: [&str; 6] = [
    "bill_item_id",
    "quantity",
    "price",
    "product_id",
    "bill_id",
    "product_description",
];

/// Columns every `bill_201Y_M` table carries. Any others are read as extras.
pub const BILL_CONTRACT_COLUMNS: [&str; 5] = [
    "bill_id",
    "date_created",
    "total_amount",
    "account_number",
    "account_name",
];

/// MySQL SQLSTATE for "base table or view not found".
const SQLSTATE_NO_SUCH_TABLE: &str = "42S02";

pub fn bill_table_name(period: Period) -> String {
    format!("bill_201{}_{}", period.year_suffix(), period.month())
}

pub fn bill_items_table_name(period: Period) -> String {
    format!("bill_items_201{}_{}", period.year_suffix(), period.month())
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("table {table} not found in source database {database}")]
    MissingTable { database: String, table: String },
    #[error("invalid source connection url: {0}")]
    InvalidUrl(#[source] sqlx::Error),
    #[error("connecting to source database {database}: {source}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading {database}.{table}: {source}")]
    Query {
        database: String,
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading fixture {path}: {source}")]
    FixtureIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fixture {path}: {source}")]
    FixtureParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read access to one source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn database(&self) -> &str;

    async fn fetch_bills(&self, period: Period) -> Result<Vec<SourceBill>, SourceError>;

    async fn fetch_bill_items(&self, period: Period) -> Result<Vec<SourceBillItem>, SourceError>;

    async fn fetch_stock_categories(&self) -> Result<Vec<StockCategory>, SourceError>;

    async fn fetch_stock_products(&self) -> Result<Vec<StockProduct>, SourceError>;
}

/// Opens a reader for a named source database.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, database: &str) -> Result<Box<dyn SourceReader>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct MySqlConnector {
    base: MySqlConnectOptions,
}

impl MySqlConnector {
    /// `url` carries host, port and credentials; the database name is chosen
    /// per plan entry.
    pub fn from_url(url: &str) -> Result<Self, SourceError> {
        let base = MySqlConnectOptions::from_str(url).map_err(SourceError::InvalidUrl)?;
        Ok(Self { base })
    }
}

#[async_trait]
impl SourceConnector for MySqlConnector {
    async fn connect(&self, database: &str) -> Result<Box<dyn SourceReader>, SourceError> {
        let options = self.base.clone().database(database);
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| SourceError::Connect {
                database: database.to_string(),
                source,
            })?;
        Ok(Box::new(MySqlSource {
            database: database.to_string(),
            pool,
        }))
    }
}

pub struct MySqlSource {
    database: String,
    pool: MySqlPool,
}

impl MySqlSource {
    async fn fetch_rows(&self, table: &str, sql: &str) -> Result<Vec<MySqlRow>, SourceError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.classify(table, err))?;
        debug!(database = %self.database, table, rows = rows.len(), "fetched source table");
        Ok(rows)
    }

    fn classify(&self, table: &str, err: sqlx::Error) -> SourceError {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(SQLSTATE_NO_SUCH_TABLE) {
                return SourceError::MissingTable {
                    database: self.database.clone(),
                    table: table.to_string(),
                };
            }
        }
        self.query_error(table, err)
    }

    fn query_error(&self, table: &str, source: sqlx::Error) -> SourceError {
        SourceError::Query {
            database: self.database.clone(),
            table: table.to_string(),
            source,
        }
    }

    fn decode<T>(
        &self,
        table: &str,
        rows: &[MySqlRow],
        decode_row: impl Fn(&MySqlRow) -> Result<T, sqlx::Error>,
    ) -> Result<Vec<T>, SourceError> {
        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| self.query_error(table, err))
    }

    /// `(column_name, data_type)` pairs in table order.
    async fn table_columns(&self, table: &str) -> Result<Vec<(String, String)>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT CAST(column_name AS CHAR) AS column_name,
                   CAST(data_type AS CHAR) AS data_type
              FROM information_schema.columns
             WHERE table_schema = DATABASE()
               AND table_name = ?
             ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| self.query_error(table, err))?;
        if rows.is_empty() {
            return Err(SourceError::MissingTable {
                database: self.database.clone(),
                table: table.to_string(),
            });
        }
        rows.iter()
            .map(|row| Ok((row.try_get("column_name")?, row.try_get("data_type")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| self.query_error(table, err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtraKind {
    Int,
    Float,
    Text,
}

fn extra_kind(data_type: &str) -> ExtraKind {
    match data_type.to_ascii_lowercase().as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" | "bit" => {
            ExtraKind::Int
        }
        "float" | "double" | "real" | "decimal" | "numeric" => ExtraKind::Float,
        _ => ExtraKind::Text,
    }
}

// `CAST(... AS DOUBLE)` needs MySQL 8.0.17; multiplying by a DOUBLE literal
// yields DOUBLE on every server version.
fn as_double(column: &str) -> String {
    format!("({} * 1E0)", quote_ident(column))
}

fn extra_select(column: &str, kind: ExtraKind) -> String {
    let expr = match kind {
        ExtraKind::Int => format!("CAST({} AS SIGNED)", quote_ident(column)),
        ExtraKind::Float => as_double(column),
        ExtraKind::Text => format!("CAST({} AS CHAR)", quote_ident(column)),
    };
    format!("{expr} AS {}", quote_ident(column))
}

fn bills_select_sql(table: &str, extras: &[(String, ExtraKind)]) -> String {
    let mut columns = vec![
        "CAST(`bill_id` AS SIGNED) AS `bill_id`".to_string(),
        "CAST(`date_created` AS DATETIME) AS `date_created`".to_string(),
        format!("{} AS `total_amount`", as_double("total_amount")),
        "CAST(`account_number` AS CHAR) AS `account_number`".to_string(),
        "CAST(`account_name` AS CHAR) AS `account_name`".to_string(),
    ];
    columns.extend(extras.iter().map(|(name, kind)| extra_select(name, *kind)));
    format!("SELECT {} FROM {}", columns.join(", "), quote_ident(table))
}

fn bill_items_select_sql(table: &str) -> String {
    format!(
        "SELECT CAST(`bill_item_id` AS SIGNED) AS `bill_item_id`, \
         {} AS `quantity`, \
         {} AS `price`, \
         CAST(`product_id` AS SIGNED) AS `product_id`, \
         CAST(`bill_id` AS SIGNED) AS `bill_id`, \
         CAST(`product_description` AS CHAR) AS `product_description` \
         FROM {}",
        as_double("quantity"),
        as_double("price"),
        quote_ident(table)
    )
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn extras_from_row(
    row: &MySqlRow,
    extras: &[(String, ExtraKind)],
) -> Result<ExtraColumns, sqlx::Error> {
    extras
        .iter()
        .map(|(name, kind)| {
            let value = match kind {
                ExtraKind::Int => row.try_get::<Option<i64>, _>(name.as_str())?.map(ColumnValue::Int),
                ExtraKind::Float => row.try_get::<Option<f64>, _>(name.as_str())?.map(ColumnValue::Float),
                ExtraKind::Text => row.try_get::<Option<String>, _>(name.as_str())?.map(ColumnValue::Text),
            };
            Ok((name.clone(), value))
        })
        .collect()
}

fn bill_from_row(row: &MySqlRow, extras: &[(String, ExtraKind)]) -> Result<SourceBill, sqlx::Error> {
    Ok(SourceBill {
        bill_id: row.try_get("bill_id")?,
        date_created: row.try_get("date_created")?,
        total_amount: row.try_get("total_amount")?,
        account_number: row.try_get("account_number")?,
        account_name: row.try_get("account_name")?,
        extra: extras_from_row(row, extras)?,
    })
}

fn bill_item_from_row(row: &MySqlRow) -> Result<SourceBillItem, sqlx::Error> {
    Ok(SourceBillItem {
        bill_item_id: row.try_get("bill_item_id")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        product_id: row.try_get("product_id")?,
        bill_id: row.try_get("bill_id")?,
        product_description: row.try_get("product_description")?,
    })
}

fn category_from_row(row: &MySqlRow) -> Result<StockCategory, sqlx::Error> {
    Ok(StockCategory {
        category_id: row.try_get("category_id")?,
        category_code: row.try_get("category_code")?,
        category_description: row.try_get("category_description")?,
        parent_category_id: row.try_get("parent_category_id")?,
        is_perishable: row.try_get("is_perishable")?,
        is_modified: row.try_get("is_modified")?,
    })
}

fn product_from_row(row: &MySqlRow) -> Result<StockProduct, sqlx::Error> {
    Ok(StockProduct {
        product_id: row.try_get("product_id")?,
        product_code: row.try_get("product_code")?,
        product_bar_code: row.try_get("product_bar_code")?,
        product_description: row.try_get("product_description")?,
        is_av_product: row.try_get("is_av_product")?,
        measurement_unit_id: row.try_get("measurement_unit_id")?,
        category_id: row.try_get("category_id")?,
    })
}

// Casts pin every column to one wire type regardless of how each yearly
// database declared it.
#[async_trait]
impl SourceReader for MySqlSource {
    fn database(&self) -> &str {
        &self.database
    }

    async fn fetch_bills(&self, period: Period) -> Result<Vec<SourceBill>, SourceError> {
        let table = bill_table_name(period);
        let extras = self
            .table_columns(&table)
            .await?
            .into_iter()
            .filter(|(name, _)| !BILL_CONTRACT_COLUMNS.contains(&name.as_str()))
            .map(|(name, data_type)| (name, extra_kind(&data_type)))
            .collect::<Vec<_>>();
        let rows = self.fetch_rows(&table, &bills_select_sql(&table, &extras)).await?;
        self.decode(&table, &rows, |row| bill_from_row(row, &extras))
    }

    async fn fetch_bill_items(&self, period: Period) -> Result<Vec<SourceBillItem>, SourceError> {
        let table = bill_items_table_name(period);
        let rows = self.fetch_rows(&table, &bill_items_select_sql(&table)).await?;
        self.decode(&table, &rows, bill_item_from_row)
    }

    async fn fetch_stock_categories(&self) -> Result<Vec<StockCategory>, SourceError> {
        let sql = format!(
            r#"
            SELECT CAST(category_id AS SIGNED) AS category_id,
                   CAST(category_code AS CHAR) AS category_code,
                   CAST(category_description AS CHAR) AS category_description,
                   CAST(parent_category_id AS SIGNED) AS parent_category_id,
                   CAST(is_perishable AS CHAR) AS is_perishable,
                   CAST(is_modified AS CHAR) AS is_modified
              FROM {}
            "#,
            quote_ident(STOCK_CATEGORY_TABLE)
        );
        let rows = self.fetch_rows(STOCK_CATEGORY_TABLE, &sql).await?;
        self.decode(STOCK_CATEGORY_TABLE, &rows, category_from_row)
    }

    async fn fetch_stock_products(&self) -> Result<Vec<StockProduct>, SourceError> {
        let sql = format!(
            r#"
            SELECT CAST(product_id AS SIGNED) AS product_id,
                   CAST(product_code AS CHAR) AS product_code,
                   CAST(product_bar_code AS CHAR) AS product_bar_code,
                   CAST(product_description AS CHAR) AS product_description,
                   CAST(is_av_product AS CHAR) AS is_av_product,
                   CAST(measurement_unit_id AS SIGNED) AS measurement_unit_id,
                   CAST(category_id AS SIGNED) AS category_id
              FROM {}
            "#,
            quote_ident(STOCK_PRODUCT_TABLE)
        );
        let rows = self.fetch_rows(STOCK_PRODUCT_TABLE, &sql).await?;
        self.decode(STOCK_PRODUCT_TABLE, &rows, product_from_row)
    }
}

/// JSON dump of one source database, keyed by source table name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDatabase {
    pub database: String,
    #[serde(default)]
    pub bills: BTreeMap<String, Vec<SourceBill>>,
    #[serde(default)]
    pub bill_items: BTreeMap<String, Vec<SourceBillItem>>,
    #[serde(default)]
    pub stock_category: Option<Vec<StockCategory>>,
    #[serde(default)]
    pub stock_product: Option<Vec<StockProduct>>,
}

pub fn load_fixture_database(path: &Path) -> Result<FixtureDatabase, SourceError> {
    let text = std::fs::read_to_string(path).map_err(|source| SourceError::FixtureIo {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SourceError::FixtureParse {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    fixture: FixtureDatabase,
}

impl FixtureSource {
    pub fn new(fixture: FixtureDatabase) -> Self {
        Self { fixture }
    }

    fn missing(&self, table: &str) -> SourceError {
        SourceError::MissingTable {
            database: self.fixture.database.clone(),
            table: table.to_string(),
        }
    }
}

#[async_trait]
impl SourceReader for FixtureSource {
    fn database(&self) -> &str {
        &self.fixture.database
    }

    async fn fetch_bills(&self, period: Period) -> Result<Vec<SourceBill>, SourceError> {
        let table = bill_table_name(period);
        self.fixture
            .bills
            .get(&table)
            .cloned()
            .ok_or_else(|| self.missing(&table))
    }

    async fn fetch_bill_items(&self, period: Period) -> Result<Vec<SourceBillItem>, SourceError> {
        let table = bill_items_table_name(period);
        self.fixture
            .bill_items
            .get(&table)
            .cloned()
            .ok_or_else(|| self.missing(&table))
    }

    async fn fetch_stock_categories(&self) -> Result<Vec<StockCategory>, SourceError> {
        self.fixture
            .stock_category
            .clone()
            .ok_or_else(|| self.missing(STOCK_CATEGORY_TABLE))
    }

    async fn fetch_stock_products(&self) -> Result<Vec<StockProduct>, SourceError> {
        self.fixture
            .stock_product
            .clone()
            .ok_or_else(|| self.missing(STOCK_PRODUCT_TABLE))
    }
}

/// Resolves a database name to `<dir>/<database>.json`.
#[derive(Debug, Clone)]
pub struct FixtureConnector {
    dir: PathBuf,
}

impl FixtureConnector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, database: &str) -> PathBuf {
        self.dir.join(format!("{database}.json"))
    }
}

#[async_trait]
impl SourceConnector for FixtureConnector {
    async fn connect(&self, database: &str) -> Result<Box<dyn SourceReader>, SourceError> {
        let mut fixture = load_fixture_database(&self.path_for(database))?;
        if fixture.database.is_empty() {
            fixture.database = database.to_string();
        }
        Ok(Box::new(FixtureSource::new(fixture)))
    }
}
