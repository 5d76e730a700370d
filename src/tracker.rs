use crate::attachments::{AttachmentKind, AttachmentStore, Upload, MAX_CATEGORY_FILES, MAX_TASK_FILES};
use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::errors::{AppError, AppResult};
use crate::ids::{is_record_id, new_record_id};
use crate::models::{
    Attachment, Category, CategoryListView, CategoryOption, CategorySummary, CategoryViewParams, MutationOutcome,
    Task, TaskListView, TaskViewParams,
};
use crate::query::{self, group_by_day, page_from_param, page_size_from_param, page_size_options, paginate};
use crate::sanitize::{
    fold_case, parse_progress, sanitize_category_name, sanitize_color, sanitize_description, sanitize_file_name,
    sanitize_title,
};
use crate::store::JsonArrayStore;
use chrono::SecondsFormat;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which page a mutation was posted to. Each page accepts only its own actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScope {
    Tasks,
    Categories,
}

/// Decoded request body: repeated text fields plus file uploads, keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct FormFields {
    values: HashMap<String, Vec<String>>,
    uploads: HashMap<String, Vec<Upload>>,
}

impl FormFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut fields = Self::new();
        for (key, value) in pairs {
            fields.push_value(key, value);
        }
        fields
    }

    pub fn push_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(normalize_key(key.into())).or_default().push(value.into());
    }

    pub fn push_upload(&mut self, key: impl Into<String>, upload: Upload) {
        self.uploads.entry(normalize_key(key.into())).or_default().push(upload);
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn all(&self, key: &str) -> Vec<String> {
        self.values.get(key).cloned().unwrap_or_default()
    }

    fn text(&self, key: &str) -> String {
        self.first(key).unwrap_or_default().to_string()
    }

    fn flag(&self, key: &str) -> bool {
        self.first(key)
            .map(str::trim)
            .is_some_and(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
    }

    fn take_uploads(&mut self, key: &str) -> Vec<Upload> {
        self.uploads.remove(key).unwrap_or_default()
    }
}

/// `delete_files[]` and `delete_files` name the same list.
fn normalize_key(key: String) -> String {
    match key.strip_suffix("[]") {
        Some(stripped) => stripped.to_string(),
        None => key,
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    AddTask {
        title: String,
        description: String,
        category_id: Option<String>,
        attachment: Option<Upload>,
    },
    ToggleTask {
        id: String,
    },
    SetProgress {
        id: String,
        progress: String,
    },
    EditTask {
        id: String,
        title: String,
        description: String,
        progress: Option<String>,
        /// `None` keeps the current category, `Some("")` clears it.
        category_id: Option<String>,
        attachment: Option<Upload>,
        remove_attachment: bool,
    },
    DeleteTask {
        id: String,
    },
    AddCategory {
        name: String,
        color: String,
        files: Vec<Upload>,
    },
    EditCategory {
        id: String,
        name: String,
        color: String,
        delete_files: Vec<String>,
        files: Vec<Upload>,
    },
    DeleteCategory {
        id: String,
    },
}

impl Mutation {
    pub fn parse(scope: ActionScope, mut fields: FormFields) -> AppResult<Self> {
        let action = fields.text("action");
        let mutation = match (scope, action.as_str()) {
            (ActionScope::Tasks, "add") => Self::AddTask {
                title: fields.text("title"),
                description: fields.text("description"),
                category_id: fields.first("category_id").map(ToString::to_string),
                attachment: first_present(fields.take_uploads("attachment")),
            },
            (ActionScope::Tasks, "toggle") => Self::ToggleTask { id: fields.text("id") },
            (ActionScope::Tasks, "setProgress") => Self::SetProgress {
                id: fields.text("id"),
                progress: fields.text("progress"),
            },
            (ActionScope::Tasks, "edit") => Self::EditTask {
                id: fields.text("id"),
                title: fields.text("title"),
                description: fields.text("description"),
                progress: fields.first("progress").map(ToString::to_string),
                category_id: fields.first("category_id").map(ToString::to_string),
                remove_attachment: fields.flag("remove_attachment"),
                attachment: first_present(fields.take_uploads("attachment")),
            },
            (ActionScope::Tasks, "delete") => Self::DeleteTask { id: fields.text("id") },
            (ActionScope::Categories, "addCategory") => Self::AddCategory {
                name: fields.text("category_name"),
                color: fields.text("category_color"),
                files: fields.take_uploads("category_files"),
            },
            (ActionScope::Categories, "editCategory") => Self::EditCategory {
                id: fields.text("category_id"),
                name: fields.text("category_name"),
                color: fields.text("category_color"),
                delete_files: fields.all("delete_files"),
                files: fields.take_uploads("category_files"),
            },
            (ActionScope::Categories, "deleteCategory") => Self::DeleteCategory {
                id: fields.text("category_id"),
            },
            _ => return Err(AppError::InvalidAction("Invalid action".to_string())),
        };
        Ok(mutation)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddTask { .. } => "add",
            Self::ToggleTask { .. } => "toggle",
            Self::SetProgress { .. } => "setProgress",
            Self::EditTask { .. } => "edit",
            Self::DeleteTask { .. } => "delete",
            Self::AddCategory { .. } => "addCategory",
            Self::EditCategory { .. } => "editCategory",
            Self::DeleteCategory { .. } => "deleteCategory",
        }
    }
}

fn first_present(uploads: Vec<Upload>) -> Option<Upload> {
    uploads.into_iter().find(Upload::is_present)
}

/// Owns the two record stores and their attachment directories. Every mutation is a full
/// load, mutate, save cycle under one in-process writer lock.
pub struct TaskTracker {
    tasks: JsonArrayStore<Task>,
    categories: JsonArrayStore<Category>,
    task_files: AttachmentStore,
    category_files: AttachmentStore,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    default_page_size: usize,
    max_page_size: usize,
}

impl TaskTracker {
    pub fn new(data_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let config = TrackerConfig {
            data_dir: data_dir.into(),
            ..TrackerConfig::default()
        };
        Self::with_clock(&config, clock)
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: JsonArrayStore::new(config.tasks_path()),
            categories: JsonArrayStore::new(config.categories_path()),
            task_files: AttachmentStore::new(config.task_uploads_dir(), AttachmentKind::Task),
            category_files: AttachmentStore::new(config.category_uploads_dir(), AttachmentKind::Category),
            clock,
            write_lock: Mutex::new(()),
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.load().records
    }

    pub fn categories(&self) -> Vec<Category> {
        self.categories.load().records
    }

    pub fn task_files(&self) -> &AttachmentStore {
        &self.task_files
    }

    pub fn category_files(&self) -> &AttachmentStore {
        &self.category_files
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| AppError::Internal("tracker write lock poisoned".to_string()))
    }

    pub fn apply(&self, mutation: Mutation) -> AppResult<MutationOutcome> {
        let action = mutation.name();
        let outcome = match mutation {
            Mutation::AddTask {
                title,
                description,
                category_id,
                attachment,
            } => self.add_task(&title, &description, category_id.as_deref(), attachment),
            Mutation::ToggleTask { id } => self.toggle_task(&id),
            Mutation::SetProgress { id, progress } => self.set_progress(&id, &progress),
            Mutation::EditTask {
                id,
                title,
                description,
                progress,
                category_id,
                attachment,
                remove_attachment,
            } => self.edit_task(TaskEdit {
                id: &id,
                title: &title,
                description: &description,
                progress: progress.as_deref(),
                category_id: category_id.as_deref(),
                attachment,
                remove_attachment,
            }),
            Mutation::DeleteTask { id } => self.delete_task(&id),
            Mutation::AddCategory { name, color, files } => self.add_category(&name, &color, &files),
            Mutation::EditCategory {
                id,
                name,
                color,
                delete_files,
                files,
            } => self.edit_category(&id, &name, &color, &delete_files, &files),
            Mutation::DeleteCategory { id } => self.delete_category(&id),
        }?;

        match &outcome {
            MutationOutcome::Applied { id } => tracing::info!(action = action, id = %id, "mutation applied"),
            MutationOutcome::Unchanged { reason } => tracing::info!(action = action, reason = %reason, "mutation skipped"),
        }
        Ok(outcome)
    }

    pub fn add_task(
        &self,
        title: &str,
        description: &str,
        category_id: Option<&str>,
        attachment: Option<Upload>,
    ) -> AppResult<MutationOutcome> {
        let title = sanitize_title(title);
        if title.is_empty() {
            return Ok(MutationOutcome::unchanged("title is empty"));
        }
        let description = sanitize_description(description);

        let _guard = self.lock()?;
        let id = new_record_id();
        let stored = self.task_files.store(attachment.as_slice(), &id, MAX_TASK_FILES)?;

        let mut task = Task {
            id: id.clone(),
            title,
            description,
            done: false,
            progress: 0,
            created_at: self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, false),
            category_id: None,
            category_name: None,
            category_color: None,
            attachment: stored.first().cloned(),
        };
        if let Some(category_id) = category_id {
            let categories = self.categories.load().records;
            task.assign_category(find_category(&categories, category_id));
        }

        let mut tasks = self.tasks.load().records;
        tasks.push(task);
        if let Err(error) = self.tasks.save(&tasks) {
            self.task_files.delete_all(&stored);
            return Err(error);
        }
        Ok(MutationOutcome::applied(id))
    }

    /// Flips `done`; progress is left as it was.
    pub fn toggle_task(&self, id: &str) -> AppResult<MutationOutcome> {
        self.update_task(id, |task| task.done = !task.done)
    }

    pub fn set_progress(&self, id: &str, raw: &str) -> AppResult<MutationOutcome> {
        let Some(progress) = parse_progress(raw) else {
            return Ok(MutationOutcome::unchanged("progress is not a number"));
        };
        self.update_task(id, |task| task.apply_progress(progress))
    }

    fn update_task(&self, id: &str, change: impl FnOnce(&mut Task)) -> AppResult<MutationOutcome> {
        if !is_record_id(id) {
            return Ok(MutationOutcome::unchanged("invalid task id"));
        }
        let _guard = self.lock()?;
        let mut tasks = self.tasks.load().records;
        let Some(task) = tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(MutationOutcome::unchanged("task not found"));
        };
        change(task);
        self.tasks.save(&tasks)?;
        Ok(MutationOutcome::applied(id))
    }

    pub fn edit_task(&self, edit: TaskEdit<'_>) -> AppResult<MutationOutcome> {
        if !is_record_id(edit.id) {
            return Ok(MutationOutcome::unchanged("invalid task id"));
        }
        let title = sanitize_title(edit.title);
        if title.is_empty() {
            return Ok(MutationOutcome::unchanged("title is empty"));
        }
        let description = sanitize_description(edit.description);

        let _guard = self.lock()?;
        let mut tasks = self.tasks.load().records;
        let Some(index) = tasks.iter().position(|task| task.id == edit.id) else {
            return Ok(MutationOutcome::unchanged("task not found"));
        };

        let stored = self.task_files.store(edit.attachment.as_slice(), edit.id, MAX_TASK_FILES)?;
        let categories = match edit.category_id {
            Some(_) => self.categories.load().records,
            None => Vec::new(),
        };

        let task = &mut tasks[index];
        task.title = title;
        task.description = description;
        if let Some(progress) = edit.progress.and_then(parse_progress) {
            task.apply_progress(progress);
        }
        if let Some(category_id) = edit.category_id {
            task.assign_category(find_category(&categories, category_id));
        }

        let mut replaced = None;
        if let Some(new_attachment) = stored.first() {
            replaced = task.attachment.replace(new_attachment.clone());
        } else if edit.remove_attachment {
            replaced = task.attachment.take();
        }

        if let Err(error) = self.tasks.save(&tasks) {
            self.task_files.delete_all(&stored);
            return Err(error);
        }
        if let Some(old) = replaced {
            self.task_files.delete(&old.stored);
        }
        Ok(MutationOutcome::applied(edit.id))
    }

    /// Removes the record first; the attachment file goes only after the save.
    pub fn delete_task(&self, id: &str) -> AppResult<MutationOutcome> {
        if !is_record_id(id) {
            return Ok(MutationOutcome::unchanged("invalid task id"));
        }
        let _guard = self.lock()?;
        let mut tasks = self.tasks.load().records;
        let Some(index) = tasks.iter().position(|task| task.id == id) else {
            return Ok(MutationOutcome::unchanged("task not found"));
        };
        let removed = tasks.remove(index);
        self.tasks.save(&tasks)?;
        if let Some(attachment) = removed.attachment {
            self.task_files.delete(&attachment.stored);
        }
        Ok(MutationOutcome::applied(id))
    }

    pub fn add_category(&self, name: &str, color: &str, files: &[Upload]) -> AppResult<MutationOutcome> {
        let name = sanitize_category_name(name);
        if name.is_empty() {
            return Ok(MutationOutcome::unchanged("category name is empty"));
        }
        let color = sanitize_color(color);

        let _guard = self.lock()?;
        let mut categories = self.categories.load().records;
        if name_taken(&categories, &name, None) {
            return Ok(MutationOutcome::unchanged("category name already exists"));
        }

        let id = new_record_id();
        let stored = self.category_files.store(files, &id, MAX_CATEGORY_FILES)?;
        categories.push(Category {
            id: id.clone(),
            name,
            color,
            files: stored.clone(),
        });
        if let Err(error) = self.categories.save(&categories) {
            self.category_files.delete_all(&stored);
            return Err(error);
        }
        Ok(MutationOutcome::applied(id))
    }

    /// Renames and recolors a category, swaps its files and carries the new name and color to
    /// every task filed under it, including legacy tasks that only recorded the old name.
    pub fn edit_category(
        &self,
        id: &str,
        name: &str,
        color: &str,
        delete_files: &[String],
        files: &[Upload],
    ) -> AppResult<MutationOutcome> {
        if !is_record_id(id) {
            return Ok(MutationOutcome::unchanged("invalid category id"));
        }
        let name = sanitize_category_name(name);
        if name.is_empty() {
            return Ok(MutationOutcome::unchanged("category name is empty"));
        }
        let color = sanitize_color(color);

        let _guard = self.lock()?;
        let mut categories = self.categories.load().records;
        let Some(index) = categories.iter().position(|category| category.id == id) else {
            return Ok(MutationOutcome::unchanged("category not found"));
        };
        if name_taken(&categories, &name, Some(id)) {
            return Ok(MutationOutcome::unchanged("category name already exists"));
        }

        let category = &mut categories[index];
        let old_name = fold_case(&category.name);
        let (removed, mut kept): (Vec<Attachment>, Vec<Attachment>) = std::mem::take(&mut category.files)
            .into_iter()
            .partition(|file| delete_files.iter().any(|stored| stored == &file.stored));

        let slots = MAX_CATEGORY_FILES.saturating_sub(kept.len());
        let stored = self.category_files.store(files, id, slots)?;
        kept.extend(stored.iter().cloned());
        kept.truncate(MAX_CATEGORY_FILES);

        category.name = name;
        category.color = color;
        category.files = kept;
        let updated = category.clone();

        let mut tasks = self.tasks.load().records;
        let mut cascaded = 0usize;
        for task in tasks.iter_mut() {
            let by_id = task.category_id.as_deref() == Some(id);
            let by_legacy_name = task.category_id.is_none()
                && task
                    .category_name
                    .as_deref()
                    .is_some_and(|value| fold_case(value) == old_name);
            if by_id || by_legacy_name {
                task.assign_category(Some(&updated));
                cascaded += 1;
            }
        }

        if let Err(error) = self.categories.save(&categories) {
            self.category_files.delete_all(&stored);
            return Err(error);
        }
        self.category_files.delete_all(&removed);
        if cascaded > 0 {
            self.tasks.save(&tasks)?;
            tracing::debug!(category = %id, tasks = cascaded, "cascaded category change to tasks");
        }
        Ok(MutationOutcome::applied(id))
    }

    /// Drops the category and its files, then unlinks every task filed under it by id or by
    /// legacy name.
    pub fn delete_category(&self, id: &str) -> AppResult<MutationOutcome> {
        if !is_record_id(id) {
            return Ok(MutationOutcome::unchanged("invalid category id"));
        }
        let _guard = self.lock()?;
        let mut categories = self.categories.load().records;
        let Some(index) = categories.iter().position(|category| category.id == id) else {
            return Ok(MutationOutcome::unchanged("category not found"));
        };
        let removed = categories.remove(index);
        self.categories.save(&categories)?;
        self.category_files.delete_all(&removed.files);

        let removed_name = fold_case(&removed.name);
        let mut tasks = self.tasks.load().records;
        let mut cleared = 0usize;
        for task in tasks.iter_mut() {
            let by_id = task.category_id.as_deref() == Some(id);
            let by_legacy_name = task.category_id.is_none()
                && task
                    .category_name
                    .as_deref()
                    .is_some_and(|value| fold_case(value) == removed_name);
            if by_id || by_legacy_name {
                task.clear_category();
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.tasks.save(&tasks)?;
        }
        Ok(MutationOutcome::applied(id))
    }

    pub fn task_view(&self, params: &TaskViewParams) -> TaskListView {
        let loaded = self.tasks.load();
        let categories = self.categories.load().records;
        let total_count = loaded.records.len();
        let completed_count = loaded.records.iter().filter(|task| task.done).count();
        let editing = params
            .edit
            .as_deref()
            .filter(|id| is_record_id(id))
            .and_then(|id| loaded.records.iter().find(|task| task.id == id).cloned());

        let search = params.q.as_deref().unwrap_or_default().trim().to_string();
        let per_page = page_size_from_param(params.per_page.as_deref(), self.default_page_size, self.max_page_size);
        let matching = query::filter(loaded.records, &search);
        let matching_count = matching.len();
        let page = paginate(
            matching,
            page_from_param(params.page.as_deref()),
            per_page,
            self.max_page_size,
        );

        let mut options: Vec<CategoryOption> = categories
            .into_iter()
            .map(|category| CategoryOption {
                id: category.id,
                name: category.name,
                color: category.color,
            })
            .collect();
        options.sort_by_key(|option| fold_case(&option.name));

        TaskListView {
            csrf_token: None,
            query: search,
            page: page.page,
            per_page: page.page_size,
            total_pages: page.total_pages,
            matching_count,
            total_count,
            completed_count,
            groups: group_by_day(page.items),
            editing,
            categories: options,
            page_size_options: page_size_options(self.max_page_size),
            dropped_records: loaded.dropped,
        }
    }

    pub fn category_view(&self, params: &CategoryViewParams) -> CategoryListView {
        let loaded = self.categories.load();
        let tasks = self.tasks.load().records;
        let search = params.q.as_deref().unwrap_or_default().trim().to_string();

        let mut matching = query::filter(loaded.records, &search);
        matching.sort_by_key(|category| fold_case(&category.name));

        let categories = matching
            .into_iter()
            .map(|category| {
                let task_count = tasks
                    .iter()
                    .filter(|task| task.category_id.as_deref() == Some(category.id.as_str()))
                    .count();
                CategorySummary {
                    slots_available: category.slots_available(),
                    task_count,
                    category,
                }
            })
            .collect();

        CategoryListView {
            csrf_token: None,
            query: search,
            categories,
            max_files: MAX_CATEGORY_FILES,
            dropped_records: loaded.dropped,
        }
    }

    /// Path and original name of a task attachment that some task still references.
    pub fn task_download(&self, requested: &str) -> AppResult<(PathBuf, String)> {
        let stored = sanitize_file_name(requested);
        let path = self.task_files.locate(&stored).ok_or_else(file_not_found)?;
        let name = self
            .tasks
            .load()
            .records
            .into_iter()
            .filter_map(|task| task.attachment)
            .find(|attachment| attachment.stored == stored)
            .map(|attachment| attachment.name)
            .ok_or_else(file_not_found)?;
        if !path.is_file() {
            return Err(file_not_found());
        }
        Ok((path, name))
    }

    pub fn category_download(&self, requested: &str) -> AppResult<(PathBuf, String)> {
        let stored = sanitize_file_name(requested);
        let path = self.category_files.locate(&stored).ok_or_else(file_not_found)?;
        let name = self
            .categories
            .load()
            .records
            .into_iter()
            .flat_map(|category| category.files)
            .find(|attachment| attachment.stored == stored)
            .map(|attachment| attachment.name)
            .ok_or_else(file_not_found)?;
        if !path.is_file() {
            return Err(file_not_found());
        }
        Ok((path, name))
    }
}

/// Fields of an `edit` mutation.
#[derive(Debug)]
pub struct TaskEdit<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub progress: Option<&'a str>,
    pub category_id: Option<&'a str>,
    pub attachment: Option<Upload>,
    pub remove_attachment: bool,
}

impl<'a> TaskEdit<'a> {
    pub fn new(id: &'a str, title: &'a str, description: &'a str) -> Self {
        Self {
            id,
            title,
            description,
            progress: None,
            category_id: None,
            attachment: None,
            remove_attachment: false,
        }
    }
}

fn find_category<'a>(categories: &'a [Category], id: &str) -> Option<&'a Category> {
    if !is_record_id(id) {
        return None;
    }
    categories.iter().find(|category| category.id == id)
}

fn name_taken(categories: &[Category], name: &str, except_id: Option<&str>) -> bool {
    let folded = fold_case(name);
    categories
        .iter()
        .filter(|category| Some(category.id.as_str()) != except_id)
        .any(|category| fold_case(&category.name) == folded)
}

fn file_not_found() -> AppError {
    AppError::NotFound("File not found".to_string())
}
