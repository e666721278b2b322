//! Core row model, period keys and pure transforms for PTDC consolidation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::Hash;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ptdc-core";

/// Local bill ids must stay below this for `bill_uid` to be collision-free.
pub const BILL_LOCAL_BUDGET: i64 = 100_000;
/// Local bill item ids must stay below this for `bill_item_uid` to be collision-free.
pub const BILL_ITEM_LOCAL_BUDGET: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Bill,
    BillItem,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Bill => f.write_str("bill"),
            KeyKind::BillItem => f.write_str("bill item"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("invalid period: year suffix {year_suffix} must be 0..=9 and month {month} must be 1..=12")]
    InvalidPeriod { year_suffix: u8, month: u8 },
    #[error("{kind} local id {local_id} in period {period} is outside the 0..{budget} digit budget")]
    KeyBudgetExceeded {
        kind: KeyKind,
        period: Period,
        local_id: i64,
        budget: i64,
    },
    #[error("column {column} value {value} does not fit {target}")]
    Narrowing {
        column: &'static str,
        value: String,
        target: &'static str,
    },
}

/// One monthly partition of the source data, identified by the last digit of
/// the calendar year (`201Y`) and the calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawPeriod", into = "RawPeriod")]
pub struct Period {
    year_suffix: u8,
    month: u8,
}

#[derive(Serialize, Deserialize)]
struct RawPeriod {
    year_suffix: u8,
    month: u8,
}

impl TryFrom<RawPeriod> for Period {
    type Error = CoreError;

    fn try_from(raw: RawPeriod) -> Result<Self, Self::Error> {
        Period::new(raw.year_suffix, raw.month)
    }
}

impl From<Period> for RawPeriod {
    fn from(period: Period) -> Self {
        Self {
            year_suffix: period.year_suffix,
            month: period.month,
        }
    }
}

impl Period {
    pub fn new(year_suffix: u8, month: u8) -> Result<Self, CoreError> {
        if year_suffix > 9 || !(1..=12).contains(&month) {
            return Err(CoreError::InvalidPeriod { year_suffix, month });
        }
        Ok(Self { year_suffix, month })
    }

    pub fn year_suffix(&self) -> u8 {
        self.year_suffix
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn calendar_year(&self) -> u16 {
        2010 + u16::from(self.year_suffix)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.calendar_year(), self.month)
    }
}

/// `10_000_000 * Y + 100_000 * M + L`
pub fn bill_uid(period: Period, local_bill_id: i64) -> Result<i64, CoreError> {
    check_budget(KeyKind::Bill, period, local_bill_id, BILL_LOCAL_BUDGET)?;
    Ok(10_000_000 * i64::from(period.year_suffix)
        + 100_000 * i64::from(period.month)
        + local_bill_id)
}

/// `100_000_000 * Y + 1_000_000 * M + L`
pub fn bill_item_uid(period: Period, local_bill_item_id: i64) -> Result<i64, CoreError> {
    check_budget(
        KeyKind::BillItem,
        period,
        local_bill_item_id,
        BILL_ITEM_LOCAL_BUDGET,
    )?;
    Ok(100_000_000 * i64::from(period.year_suffix)
        + 1_000_000 * i64::from(period.month)
        + local_bill_item_id)
}

fn check_budget(kind: KeyKind, period: Period, local_id: i64, budget: i64) -> Result<(), CoreError> {
    if (0..budget).contains(&local_id) {
        Ok(())
    } else {
        Err(CoreError::KeyBudgetExceeded {
            kind,
            period,
            local_id,
            budget,
        })
    }
}

/// Value of a source column outside the fixed contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Text(v) => f.write_str(v),
        }
    }
}

/// Remaining columns of a source row by name; `None` is SQL NULL.
pub type ExtraColumns = BTreeMap<String, Option<ColumnValue>>;

/// Row of a `bill_201Y_M` source table. Columns beyond the contract ride along
/// in `extra` and reach the destination unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBill {
    pub bill_id: i64,
    #[serde(default)]
    pub date_created: Option<NaiveDateTime>,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(flatten, default)]
    pub extra: ExtraColumns,
}

/// Projected row of a `bill_items_201Y_M` source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBillItem {
    pub bill_item_id: i64,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    pub product_id: i64,
    pub bill_id: i64,
    #[serde(default)]
    pub product_description: Option<String>,
}

/// Bill decorated with its period-qualified global id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub bill_id: i64,
    pub date_created: Option<NaiveDateTime>,
    pub bill_uid: i64,
    pub total_amount: Option<f64>,
    pub account_number: Option<String>,
    pub account_name: Option<String>,
    #[serde(flatten, default)]
    pub extra: ExtraColumns,
}

impl Bill {
    pub fn from_source(period: Period, source: SourceBill) -> Result<Self, CoreError> {
        Ok(Self {
            bill_uid: bill_uid(period, source.bill_id)?,
            bill_id: source.bill_id,
            date_created: source.date_created,
            total_amount: source.total_amount,
            account_number: source.account_number,
            account_name: source.account_name,
            extra: source.extra,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillItem {
    pub bill_item_id: i64,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub product_id: i64,
    pub bill_id: i64,
    pub product_description: Option<String>,
    pub bill_uid: i64,
    pub bill_item_uid: i64,
}

impl BillItem {
    pub fn from_source(period: Period, source: SourceBillItem) -> Result<Self, CoreError> {
        Ok(Self {
            bill_uid: bill_uid(period, source.bill_id)?,
            bill_item_uid: bill_item_uid(period, source.bill_item_id)?,
            bill_item_id: source.bill_item_id,
            quantity: source.quantity,
            price: source.price,
            product_id: source.product_id,
            bill_id: source.bill_id,
            product_description: source.product_description,
        })
    }
}

/// Storage-width form of [`BillItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactBillItem {
    pub bill_item_id: u32,
    pub quantity: Option<f32>,
    pub price: Option<f32>,
    pub product_id: u16,
    pub bill_id: u16,
    pub product_description: Option<String>,
    pub bill_uid: u32,
    pub bill_item_uid: u32,
}

impl CompactBillItem {
    pub fn try_from_item(item: &BillItem) -> Result<Self, CoreError> {
        Ok(Self {
            bill_item_id: narrow_int("bill_item_id", item.bill_item_id, "u32")?,
            quantity: narrow_float("quantity", item.quantity)?,
            price: narrow_float("price", item.price)?,
            product_id: narrow_int("product_id", item.product_id, "u16")?,
            bill_id: narrow_int("bill_id", item.bill_id, "u16")?,
            product_description: item.product_description.clone(),
            bill_uid: narrow_int("bill_uid", item.bill_uid, "u32")?,
            bill_item_uid: narrow_int("bill_item_uid", item.bill_item_uid, "u32")?,
        })
    }
}

/// Narrows every bill item to its storage width, failing on the first value
/// that does not fit.
pub fn narrow_bill_items(items: &[BillItem]) -> Result<Vec<CompactBillItem>, CoreError> {
    items.iter().map(CompactBillItem::try_from_item).collect()
}

fn narrow_int<T: TryFrom<i64>>(
    column: &'static str,
    value: i64,
    target: &'static str,
) -> Result<T, CoreError> {
    T::try_from(value).map_err(|_| CoreError::Narrowing {
        column,
        value: value.to_string(),
        target,
    })
}

fn narrow_float(column: &'static str, value: Option<f64>) -> Result<Option<f32>, CoreError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && v.abs() <= f64::from(f32::MAX) => Ok(Some(v as f32)),
        Some(v) => Err(CoreError::Narrowing {
            column,
            value: v.to_string(),
            target: "f32",
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockCategory {
    pub category_id: i64,
    #[serde(default)]
    pub category_code: Option<String>,
    #[serde(default)]
    pub category_description: Option<String>,
    #[serde(default)]
    pub parent_category_id: Option<i64>,
    #[serde(default)]
    pub is_perishable: Option<String>,
    #[serde(default)]
    pub is_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockProduct {
    pub product_id: i64,
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub product_bar_code: Option<String>,
    #[serde(default)]
    pub product_description: Option<String>,
    #[serde(default)]
    pub is_av_product: Option<String>,
    #[serde(default)]
    pub measurement_unit_id: Option<i64>,
    #[serde(default)]
    pub category_id: Option<i64>,
}

/// Natural key used to detect the same reference entity across snapshots.
pub trait BusinessKey {
    type Key: Eq + Hash;

    fn business_key(&self) -> Self::Key;
}

impl BusinessKey for StockCategory {
    type Key = (i64, Option<String>);

    fn business_key(&self) -> Self::Key {
        (self.category_id, self.category_code.clone())
    }
}

impl BusinessKey for StockProduct {
    type Key = (i64, Option<String>);

    fn business_key(&self) -> Self::Key {
        (self.product_id, self.product_code.clone())
    }
}

/// Keeps the last occurrence of every business key, at that occurrence's position.
pub fn collapse_keep_last<T: BusinessKey>(rows: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut kept = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.business_key()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

/// Reference table accumulated across source snapshots with last-write-wins
/// semantics per business key.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTable<T> {
    rows: Vec<T>,
    snapshots_merged: usize,
}

impl<T> Default for ReferenceTable<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            snapshots_merged: 0,
        }
    }
}

impl<T: BusinessKey> ReferenceTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a full snapshot and collapses duplicates. Returns the number of
    /// rows superseded by the merge.
    pub fn merge_snapshot(&mut self, snapshot: Vec<T>) -> usize {
        let mut rows = std::mem::take(&mut self.rows);
        rows.extend(snapshot);
        let before = rows.len();
        self.rows = collapse_keep_last(rows);
        self.snapshots_merged += 1;
        before - self.rows.len()
    }

    /// Drops every row matching `predicate`. Returns how many were removed.
    pub fn remove_where(&mut self, predicate: impl Fn(&T) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| !predicate(row));
        before - self.rows.len()
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn snapshots_merged(&self) -> usize {
        self.snapshots_merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(y: u8, m: u8) -> Period {
        Period::new(y, m).expect("valid period")
    }

    fn category(id: i64, code: &str, perishable: &str) -> StockCategory {
        StockCategory {
            category_id: id,
            category_code: Some(code.to_string()),
            category_description: Some(format!("category {id}")),
            parent_category_id: None,
            is_perishable: Some(perishable.to_string()),
            is_modified: Some("N".to_string()),
        }
    }

    fn item(bill_item_id: i64, bill_id: i64, product_id: i64, quantity: f64) -> BillItem {
        BillItem::from_source(
            period(3, 4),
            SourceBillItem {
                bill_item_id,
                quantity: Some(quantity),
                price: Some(10.0),
                product_id,
                bill_id,
                product_description: Some("rice".into()),
            },
        )
        .expect("in budget")
    }

    #[test]
    fn period_rejects_out_of_range_values() {
        assert!(Period::new(3, 0).is_err());
        assert!(Period::new(3, 13).is_err());
        assert!(Period::new(10, 4).is_err());
        assert_eq!(period(3, 4).to_string(), "2013-04");
    }

    #[test]
    fn period_deserialization_is_validated() {
        let ok: Period = serde_json::from_str(r#"{"year_suffix":4,"month":1}"#).unwrap();
        assert_eq!(ok, period(4, 1));
        assert!(serde_json::from_str::<Period>(r#"{"year_suffix":4,"month":13}"#).is_err());
    }

    #[test]
    fn bill_uid_matches_first_april_scenario() {
        assert_eq!(bill_uid(period(3, 4), 7).unwrap(), 30_400_007);
    }

    #[test]
    fn bill_keeps_columns_outside_the_contract() {
        let source: SourceBill = serde_json::from_str(
            r#"{"bill_id": 7, "total_amount": 99.5, "cashier_id": 3, "discount": 1.5,
                "till": "T2", "voided_by": null}"#,
        )
        .unwrap();
        assert_eq!(source.extra.len(), 4);
        assert_eq!(source.extra["cashier_id"], Some(ColumnValue::Int(3)));
        assert_eq!(source.extra["discount"], Some(ColumnValue::Float(1.5)));
        assert_eq!(source.extra["till"], Some(ColumnValue::Text("T2".into())));
        assert_eq!(source.extra["voided_by"], None);

        let bill = Bill::from_source(period(3, 4), source).unwrap();
        assert_eq!(bill.bill_uid, 30_400_007);
        assert_eq!(bill.extra["cashier_id"], Some(ColumnValue::Int(3)));
        let json = serde_json::to_value(&bill).unwrap();
        assert_eq!(json["cashier_id"], 3);
    }

    #[test]
    fn bill_item_uid_matches_first_april_scenario() {
        let item = BillItem::from_source(
            period(3, 4),
            SourceBillItem {
                bill_item_id: 42,
                quantity: None,
                price: None,
                product_id: 1,
                bill_id: 7,
                product_description: None,
            },
        )
        .unwrap();
        assert_eq!(item.bill_uid, 30_400_007);
        assert_eq!(item.bill_item_uid, 304_000_042);
    }

    #[test]
    fn global_ids_do_not_collide_across_periods() {
        let mut bill_ids = HashSet::new();
        let mut item_ids = HashSet::new();
        for y in 3..=9 {
            for m in 1..=12 {
                let p = period(y, m);
                for local in [0, 1, 7, 99_999] {
                    assert!(bill_ids.insert(bill_uid(p, local).unwrap()));
                }
                for local in [0, 1, 42, 999_999] {
                    assert!(item_ids.insert(bill_item_uid(p, local).unwrap()));
                }
            }
        }
        let max_item = bill_item_uid(period(9, 12), BILL_ITEM_LOCAL_BUDGET - 1).unwrap();
        assert!(max_item <= i64::from(i32::MAX));
    }

    #[test]
    fn local_ids_outside_digit_budget_are_rejected() {
        let err = bill_uid(period(5, 6), BILL_LOCAL_BUDGET).unwrap_err();
        assert!(matches!(
            err,
            CoreError::KeyBudgetExceeded { kind: KeyKind::Bill, local_id: 100_000, .. }
        ));
        assert!(bill_item_uid(period(5, 6), -1).is_err());
    }

    #[test]
    fn narrowing_preserves_in_range_values() {
        let compact = narrow_bill_items(&[item(42, 7, 4000, 12.5)]).unwrap();
        assert_eq!(compact[0].quantity, Some(12.5));
        assert_eq!(f64::from(compact[0].quantity.unwrap()), 12.5);
        assert_eq!(compact[0].product_id, 4000);
        assert_eq!(compact[0].bill_id, 7);
        assert_eq!(compact[0].bill_uid, 30_400_007);
        assert_eq!(compact[0].bill_item_uid, 304_000_042);
    }

    #[test]
    fn narrowing_fails_loudly_on_overflow() {
        let err = narrow_bill_items(&[item(1, 1, 70_000, 1.0)]).unwrap_err();
        assert_eq!(
            err,
            CoreError::Narrowing {
                column: "product_id",
                value: "70000".into(),
                target: "u16",
            }
        );

        let mut huge = item(1, 1, 1, 1.0);
        huge.price = Some(1e300);
        assert!(matches!(
            CompactBillItem::try_from_item(&huge),
            Err(CoreError::Narrowing { column: "price", .. })
        ));
    }

    #[test]
    fn later_snapshot_wins_for_same_business_key() {
        let mut table = ReferenceTable::new();
        table.merge_snapshot(vec![category(5, "A1", "N"), category(6, "B2", "N")]);
        let superseded = table.merge_snapshot(vec![category(5, "A1", "Y")]);

        assert_eq!(superseded, 1);
        let hits = table
            .rows()
            .iter()
            .filter(|c| c.business_key() == (5, Some("A1".to_string())))
            .collect::<Vec<_>>();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].is_perishable.as_deref(), Some("Y"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.snapshots_merged(), 2);
    }

    #[test]
    fn collapse_keeps_position_of_last_occurrence() {
        let rows = vec![category(1, "A", "N"), category(2, "B", "N"), category(1, "A", "Y")];
        let ids = collapse_keep_last(rows)
            .iter()
            .map(|c| c.category_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn merging_the_same_snapshot_twice_is_idempotent() {
        let snapshot = vec![category(5, "A1", "N"), category(7, "C3", "Y"), category(5, "A1", "Y")];
        let mut once = ReferenceTable::new();
        once.merge_snapshot(snapshot.clone());
        let mut twice = once.clone();
        twice.merge_snapshot(snapshot);
        assert_eq!(once.rows(), twice.rows());
    }

    #[test]
    fn same_id_with_different_code_is_a_distinct_entity() {
        let mut table = ReferenceTable::new();
        table.merge_snapshot(vec![category(5, "A1", "N"), category(5, "A2", "N")]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.remove_where(|c| c.category_code.as_deref() == Some("A2")), 1);
        assert_eq!(table.len(), 1);
    }
}
