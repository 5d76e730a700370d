use crate::attachments::{AttachmentKind, MAX_CATEGORY_FILES};
use crate::ids::is_record_id;
use crate::query::DayGroup;
use crate::sanitize::{
    clamp_progress, sanitize_category_name, sanitize_color, sanitize_description, sanitize_file_name,
    sanitize_title, DEFAULT_CATEGORY_COLOR,
};
use crate::store::StoredRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub stored: String,
    #[serde(default)]
    pub size: u64,
}

impl Attachment {
    fn from_stored(value: &Value, kind: AttachmentKind, owner_id: &str) -> Option<Self> {
        let object = value.as_object()?;
        let name = sanitize_file_name(&string_field(object, "name")?);
        let stored = string_field(object, "stored")?;
        if name.is_empty() || !kind.belongs_to(&stored, owner_id) {
            return None;
        }
        Some(Self {
            name,
            stored,
            size: object.get("size").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl Task {
    /// Sets progress and derives `done` from it.
    pub fn apply_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        self.done = self.progress >= 100;
    }

    pub fn assign_category(&mut self, category: Option<&Category>) {
        match category {
            Some(category) => {
                self.category_id = Some(category.id.clone());
                self.category_name = Some(category.name.clone());
                self.category_color = Some(category.color.clone());
            }
            None => self.clear_category(),
        }
    }

    pub fn clear_category(&mut self) {
        self.category_id = None;
        self.category_name = None;
        self.category_color = None;
    }
}

impl StoredRecord for Task {
    const KIND: &'static str = "task";

    fn from_stored(value: Value) -> Option<Self> {
        let object = value.as_object()?;
        let id = string_field(object, "id").filter(|id| is_record_id(id))?;
        let title = sanitize_title(&string_field(object, "title")?);
        if title.is_empty() {
            return None;
        }

        let done = object.get("done").map(truthy).unwrap_or(false);
        let progress = match object.get("progress") {
            Some(value) => number_field(value).map(|raw| clamp_progress(raw.round() as i64))?,
            // files written before progress tracking existed
            None if done => 100,
            None => 0,
        };

        let category_id = string_field(object, "category_id").filter(|value| is_record_id(value));
        let category_name = string_field(object, "category_name")
            .map(|value| sanitize_category_name(&value))
            .filter(|value| !value.is_empty());
        let category_color = if category_id.is_some() || category_name.is_some() {
            Some(
                string_field(object, "category_color")
                    .map(|value| sanitize_color(&value))
                    .unwrap_or_else(|| DEFAULT_CATEGORY_COLOR.to_string()),
            )
        } else {
            None
        };

        let attachment = object
            .get("attachment")
            .and_then(|value| Attachment::from_stored(value, AttachmentKind::Task, &id));

        Some(Self {
            id,
            title,
            description: string_field(object, "description")
                .map(|value| sanitize_description(&value))
                .unwrap_or_default(),
            done,
            progress,
            created_at: string_field(object, "created_at").unwrap_or_default(),
            category_id,
            category_name,
            category_color,
            attachment,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub files: Vec<Attachment>,
}

impl Category {
    pub fn slots_available(&self) -> usize {
        MAX_CATEGORY_FILES.saturating_sub(self.files.len())
    }
}

impl StoredRecord for Category {
    const KIND: &'static str = "category";

    fn from_stored(value: Value) -> Option<Self> {
        let object = value.as_object()?;
        let id = string_field(object, "id").filter(|id| is_record_id(id))?;
        let name = sanitize_category_name(&string_field(object, "name")?);
        if name.is_empty() {
            return None;
        }
        let color = string_field(object, "color")
            .map(|value| sanitize_color(&value))
            .unwrap_or_else(|| DEFAULT_CATEGORY_COLOR.to_string());
        let files = object
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|file| Attachment::from_stored(file, AttachmentKind::Category, &id))
                    .take(MAX_CATEGORY_FILES)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { id, name, color, files })
    }
}

/// Result of a mutation that passed authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum MutationOutcome {
    Applied { id: String },
    Unchanged { reason: String },
}

impl MutationOutcome {
    pub fn applied(id: impl Into<String>) -> Self {
        Self::Applied { id: id.into() }
    }

    pub fn unchanged(reason: impl Into<String>) -> Self {
        Self::Unchanged { reason: reason.into() }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskViewParams {
    pub q: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
    pub edit: Option<String>,
    pub download: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CategoryViewParams {
    pub q: Option<String>,
    pub download: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryOption {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListView {
    pub csrf_token: Option<String>,
    pub query: String,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub matching_count: usize,
    pub total_count: usize,
    pub completed_count: usize,
    pub groups: Vec<DayGroup<Task>>,
    pub editing: Option<Task>,
    pub categories: Vec<CategoryOption>,
    pub page_size_options: Vec<usize>,
    pub dropped_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    #[serde(flatten)]
    pub category: Category,
    pub task_count: usize,
    pub slots_available: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryListView {
    pub csrf_token: Option<String>,
    pub query: String,
    pub categories: Vec<CategorySummary>,
    pub max_files: usize,
    pub dropped_records: usize,
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(ToString::to_string)
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::String(raw) => !raw.is_empty() && raw != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
        Value::Null => false,
    }
}
