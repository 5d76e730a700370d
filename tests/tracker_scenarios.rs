use chrono::{TimeZone, Utc};
use std::fs;
use std::sync::Arc;
use taskflow_lib::attachments::Upload;
use taskflow_lib::clock::FixedClock;
use taskflow_lib::errors::AppError;
use taskflow_lib::models::{MutationOutcome, Task, TaskViewParams};
use taskflow_lib::store::{JsonArrayStore, StoredRecord};
use taskflow_lib::tracker::TaskTracker;

fn tracker() -> (tempfile::TempDir, TaskTracker) {
    let root = tempfile::tempdir().expect("temp data dir");
    let instant = Utc.with_ymd_and_hms(2026, 10, 16, 7, 45, 0).single().expect("instant");
    let tracker = TaskTracker::new(root.path(), Arc::new(FixedClock(instant)));
    (root, tracker)
}

fn applied(outcome: MutationOutcome) -> String {
    match outcome {
        MutationOutcome::Applied { id } => id,
        other => panic!("expected applied outcome, got {:?}", other),
    }
}

/// Appends a task written before category ids existed, linked by name only.
fn push_legacy_task(root: &tempfile::TempDir, category_name: &str) {
    let tasks_path = root.path().join("tasks.json");
    let mut raw: Vec<serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(&tasks_path).expect("read")).expect("json");
    raw.push(serde_json::json!({
        "id": "abcdefabcdefabcdefabcdef",
        "title": "Legacy expense claim",
        "done": false,
        "created_at": "2025-03-01T10:00:00+00:00",
        "category_id": "",
        "category_name": category_name,
        "category_color": "#336699"
    }));
    fs::write(&tasks_path, serde_json::to_string(&raw).expect("encode")).expect("write");
}

#[test]
fn buy_milk_lifecycle() {
    let (root, tracker) = tracker();
    let id = applied(
        tracker
            .add_task("Buy milk", "", None, Some(Upload::received("list.txt", b"milk\n".to_vec())))
            .expect("add"),
    );

    let tasks = tracker.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!((tasks[0].title.as_str(), tasks[0].progress, tasks[0].done), ("Buy milk", 0, false));
    let stored = tasks[0].attachment.clone().expect("attachment").stored;
    let file = root.path().join("uploads").join(&stored);
    assert!(file.exists());

    tracker.set_progress(&id, "100").expect("progress");
    assert!(tracker.tasks()[0].done);

    tracker.toggle_task(&id).expect("toggle");
    let task = tracker.tasks().remove(0);
    assert_eq!((task.done, task.progress), (false, 100));

    tracker.delete_task(&id).expect("delete");
    assert!(tracker.tasks().is_empty());
    assert!(!file.exists());
}

#[test]
fn toggling_twice_restores_state() {
    let (_root, tracker) = tracker();
    let id = applied(tracker.add_task("Stretch", "", None, None).expect("add"));
    tracker.set_progress(&id, "35").expect("progress");
    let before = tracker.tasks().remove(0);

    tracker.toggle_task(&id).expect("toggle");
    tracker.toggle_task(&id).expect("toggle");
    let after = tracker.tasks().remove(0);
    assert_eq!((after.done, after.progress), (before.done, before.progress));
}

#[test]
fn renaming_work_to_office_cascades_to_tasks() {
    let (root, tracker) = tracker();
    let work = applied(tracker.add_category("Work", "#336699", &[]).expect("add category"));
    let home = applied(tracker.add_category("Home", "#00aa00", &[]).expect("add category"));
    tracker.add_task("Quarterly report", "", Some(work.as_str()), None).expect("add");
    tracker.add_task("Standup notes", "", Some(work.as_str()), None).expect("add");
    tracker.add_task("Water plants", "", Some(home.as_str()), None).expect("add");

    push_legacy_task(&root, "work");

    tracker.edit_category(&work, "Office", "#AA5500", &[], &[]).expect("edit");

    let tasks = tracker.tasks();
    for task in tasks.iter().filter(|task| task.title != "Water plants") {
        assert_eq!(task.category_id.as_deref(), Some(work.as_str()), "{}", task.title);
        assert_eq!(task.category_name.as_deref(), Some("Office"));
        assert_eq!(task.category_color.as_deref(), Some("#aa5500"));
    }
    let untouched = tasks.iter().find(|task| task.title == "Water plants").expect("home task");
    assert_eq!(untouched.category_name.as_deref(), Some("Home"));
    assert_eq!(tracker.categories().iter().find(|c| c.id == work).map(|c| c.name.clone()), Some("Office".to_string()));
}

#[test]
fn deleting_work_unlinks_its_tasks() {
    let (root, tracker) = tracker();
    let work = applied(tracker.add_category("Work", "#336699", &[]).expect("add category"));
    let home = applied(tracker.add_category("Home", "#00aa00", &[]).expect("add category"));
    tracker.add_task("Quarterly report", "", Some(work.as_str()), None).expect("add");
    tracker.add_task("Water plants", "", Some(home.as_str()), None).expect("add");
    push_legacy_task(&root, "work");

    tracker.delete_category(&work).expect("delete");

    let tasks = tracker.tasks();
    assert_eq!(tasks.len(), 3);
    for task in tasks.iter().filter(|task| task.title != "Water plants") {
        assert_eq!(task.category_id, None, "{}", task.title);
        assert_eq!(task.category_name, None, "{}", task.title);
        assert_eq!(task.category_color, None, "{}", task.title);
    }
    let untouched = tasks.iter().find(|task| task.title == "Water plants").expect("home task");
    assert_eq!(untouched.category_id.as_deref(), Some(home.as_str()));
    assert_eq!(untouched.category_name.as_deref(), Some("Home"));
    assert_eq!(tracker.categories().len(), 1);
}

#[test]
fn search_for_milk_matches_only_buy_milk() {
    let (_root, tracker) = tracker();
    tracker.add_task("Buy milk", "", None, None).expect("add");
    tracker.add_task("Walk dog", "", None, None).expect("add");

    let view = tracker.task_view(&TaskViewParams {
        q: Some("MILK".to_string()),
        ..TaskViewParams::default()
    });
    let titles: Vec<&str> = view
        .groups
        .iter()
        .flat_map(|group| group.records.iter())
        .map(|task| task.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Buy milk"]);
    assert_eq!((view.matching_count, view.total_count), (1, 2));
}

#[test]
fn category_uploads_beyond_the_cap_are_ignored() {
    let (root, tracker) = tracker();
    let uploads: Vec<Upload> = (0..15)
        .map(|index| Upload::received(format!("part{}.md", index), b"# part".to_vec()))
        .collect();
    let id = applied(tracker.add_category("Archive", "", &uploads).expect("add"));
    let category = tracker.categories().into_iter().find(|category| category.id == id).expect("category");
    assert_eq!(category.files.len(), 10);
    assert_eq!(fs::read_dir(root.path().join("category_uploads")).expect("dir").count(), 10);
}

#[test]
fn rejected_upload_leaves_store_unchanged() {
    let (root, tracker) = tracker();
    tracker.add_task("Existing", "", None, None).expect("add");
    let before = fs::read(root.path().join("tasks.json")).expect("read");

    let result = tracker.add_task("Sneaky", "", None, Some(Upload::received("payload.exe", b"MZ".to_vec())));
    assert!(result.is_err());
    assert_eq!(fs::read(root.path().join("tasks.json")).expect("read"), before);
    assert!(!root.path().join("uploads").exists());
}

#[test]
fn failed_save_removes_the_new_attachment() {
    let (root, tracker) = tracker();
    tracker.add_task("Existing", "", None, None).expect("add");
    let tasks_path = root.path().join("tasks.json");
    let before = fs::read(&tasks_path).expect("read");

    // a directory squatting on the temp path makes the save fail
    fs::create_dir(root.path().join("tasks.json.tmp")).expect("block temp path");
    let result = tracker.add_task("Buy milk", "", None, Some(Upload::received("list.txt", b"milk\n".to_vec())));
    assert!(matches!(result, Err(AppError::Persistence(_))), "{:?}", result);

    let leftovers = fs::read_dir(root.path().join("uploads")).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
    assert_eq!(fs::read(&tasks_path).expect("read"), before);
    let tasks = tracker.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Existing");
}

#[test]
fn load_save_load_is_stable_on_disk_data() {
    let (root, tracker) = tracker();
    let category = applied(tracker.add_category("Errands", "", &[]).expect("add"));
    tracker.add_task("Post office", "stamps\nand envelopes", Some(category.as_str()), None).expect("add");
    let id = applied(tracker.add_task("Bank", "", None, None).expect("add"));
    tracker.set_progress(&id, "70").expect("progress");

    let store = JsonArrayStore::<Task>::new(root.path().join("tasks.json"));
    let first = store.load();
    assert_eq!(first.dropped, 0);
    store.save(&first.records).expect("save");
    assert_eq!(store.load().records, first.records);
    assert_eq!(<Task as StoredRecord>::KIND, "task");
}

#[test]
fn concurrent_adds_are_all_kept() {
    let (_root, tracker) = tracker();
    let tracker = Arc::new(tracker);
    let workers: Vec<_> = (0..8)
        .map(|index| {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                tracker
                    .add_task(&format!("Parallel {}", index), "", None, None)
                    .expect("add");
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
    assert_eq!(tracker.tasks().len(), 8);
}
