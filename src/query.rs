use crate::models::{Category, Task};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PAGE_SIZE_PRESETS: &[usize] = &[5, 10, 20, 50];
pub const UNKNOWN_DAY_KEY: &str = "unknown";
pub const UNKNOWN_DAY_LABEL: &str = "Unknown day";

/// Text a free-form search query is matched against.
pub trait Searchable {
    fn search_text(&self) -> String;
}

impl Searchable for Task {
    fn search_text(&self) -> String {
        format!("{}\n{}", self.title, self.description)
    }
}

impl Searchable for Category {
    fn search_text(&self) -> String {
        self.name.clone()
    }
}

/// Records whose searchable text contains `query`, ignoring case. Order is preserved.
pub fn filter<R: Searchable>(records: Vec<R>, query: &str) -> Vec<R> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| record.search_text().to_lowercase().contains(&needle))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize, max_page_size: usize) -> Page<T> {
    let page_size = page_size.clamp(1, max_page_size.max(1));
    let total_items = items.len();
    let total_pages = total_items.div_ceil(page_size).max(1);
    let page = page.clamp(1, total_pages);

    let items = items
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    Page {
        items,
        page,
        page_size,
        total_pages,
        total_items,
    }
}

pub fn page_from_param(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|page| *page > 0)
        .unwrap_or(1)
}

/// `per_page` is either one of the presets or a custom size bounded by `max_page_size`.
pub fn page_size_from_param(raw: Option<&str>, default_page_size: usize, max_page_size: usize) -> usize {
    let max_page_size = max_page_size.max(1);
    match raw.map(str::trim).and_then(|value| value.parse::<i64>().ok()) {
        Some(size) if size < 1 => default_page_size.clamp(1, max_page_size),
        Some(size) => (size as usize).min(max_page_size),
        None => default_page_size.clamp(1, max_page_size),
    }
}

pub fn page_size_options(max_page_size: usize) -> Vec<usize> {
    PAGE_SIZE_PRESETS
        .iter()
        .copied()
        .filter(|size| *size <= max_page_size)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayGroup<T> {
    pub key: String,
    pub label: String,
    pub records: Vec<T>,
}

pub trait Dated {
    fn created_at(&self) -> &str;
}

impl Dated for Task {
    fn created_at(&self) -> &str {
        &self.created_at
    }
}

/// Groups by UTC calendar day, newest day first; unparseable timestamps go to a trailing
/// "Unknown day" group. Records keep their relative order inside a group.
pub fn group_by_day<R: Dated>(records: Vec<R>) -> Vec<DayGroup<R>> {
    let mut days: BTreeMap<NaiveDate, Vec<R>> = BTreeMap::new();
    let mut unknown = Vec::new();

    for record in records {
        match parse_day(record.created_at()) {
            Some(day) => days.entry(day).or_default().push(record),
            None => unknown.push(record),
        }
    }

    let mut groups: Vec<DayGroup<R>> = days
        .into_iter()
        .rev()
        .map(|(day, records)| DayGroup {
            key: day.format("%Y-%m-%d").to_string(),
            label: day.format("%A, %B %-d, %Y").to_string(),
            records,
        })
        .collect();

    if !unknown.is_empty() {
        groups.push(DayGroup {
            key: UNKNOWN_DAY_KEY.to_string(),
            label: UNKNOWN_DAY_LABEL.to_string(),
            records: unknown,
        });
    }

    groups
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|value| value.with_timezone(&Utc).date_naive())
        .ok()
}
