//! Black-box scenarios exercising the lifecycle engine and scheduler through
//! their public APIs only, one user-visible story per test.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use qms_core::database::Database;
use qms_core::dependency::{DependencyRepo, DependencyType, DocumentDependency};
use qms_core::document::{Document, DocumentRepo, DocumentType};
use qms_core::filestore::LocalFileStore;
use qms_core::lifecycle::{LifecycleEngine, VersionType};
use qms_core::notification::LoggingNotificationDispatcher;
use qms_core::scheduler::{Scheduler, Task};
use qms_core::state::DocumentStatus;
use qms_core::user::{Capability, User, UserRepo};

struct World {
    db: Database,
    _dir: TempDir,
    author: Uuid,
    reviewer: Uuid,
    approver: Uuid,
}

fn world() -> World {
    let db = Database::in_memory().unwrap();
    let documents = DocumentRepo::new(&db);
    for code in ["SOP", "WIN", "POL"] {
        documents
            .insert_type(&DocumentType {
                code: code.to_string(),
                name: code.to_string(),
                number_prefix: code.to_string(),
                default_periodic_review_months: Some(24),
            })
            .unwrap();
    }

    let users = UserRepo::new(&db);
    let mut make_user = |name: &str, caps: &[Capability]| -> Uuid {
        let id = Uuid::new_v4();
        users
            .insert(&User {
                id,
                username: name.to_string(),
                display_name: name.to_string(),
                capabilities: caps.iter().copied().collect::<HashSet<_>>(),
                is_active: true,
                created_at: Utc::now(),
            })
            .unwrap();
        id
    };
    let author = make_user("author", &[Capability::Write]);
    let reviewer = make_user("reviewer", &[Capability::Review]);
    let approver = make_user("approver", &[Capability::Approve]);

    World {
        db,
        _dir: TempDir::new().unwrap(),
        author,
        reviewer,
        approver,
    }
}

fn make_draft(world: &World, doc_type: &str, number: &str, family_key: Uuid) -> Document {
    let documents = DocumentRepo::new(&world.db);
    let now = Utc::now();
    let doc = Document {
        id: Uuid::new_v4(),
        document_number: number.to_string(),
        title: format!("{number} title"),
        description: None,
        document_type: doc_type.to_string(),
        source: "INTERNAL".to_string(),
        version_major: 1,
        version_minor: 0,
        family_key,
        status: DocumentStatus::Draft,
        effective_date: None,
        obsolescence_date: None,
        next_periodic_review_date: None,
        author_id: world.author,
        reviewer_id: None,
        approver_id: None,
        file_reference: Some(format!("documents/{number}/1.0/original")),
        reason_for_change: None,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    documents.insert(&doc).unwrap();
    doc
}

fn engine(world: &World, store: &LocalFileStore) -> LifecycleEngine<'_> {
    LifecycleEngine::new(&world.db, store, Arc::new(LoggingNotificationDispatcher))
}

/// Carries a draft through submit -> review -> route -> approve, landing on
/// EFFECTIVE immediately (effective_date = today).
fn run_to_effective(world: &World, store: &LocalFileStore, doc: &Document) {
    let engine = engine(world, store);
    engine
        .submit_for_review(world.author, doc.id, world.reviewer, world.approver, None)
        .unwrap();
    engine.accept_review(world.reviewer, doc.id, None).unwrap();
    engine
        .complete_review(world.reviewer, doc.id, true, None)
        .unwrap();
    engine
        .route_for_approval(world.author, doc.id, None, None)
        .unwrap();
    engine.accept_approval(world.approver, doc.id, None).unwrap();
    let today = Utc::now().date_naive();
    let outcome = engine
        .approve_document(world.approver, doc.id, today, None)
        .unwrap();
    assert_eq!(outcome.new_state, Some(DocumentStatus::Effective));
}

/// Scenario 3: up-versioning copies dependency edges forward to the
/// current effective target, and reaching EFFECTIVE supersedes the prior
/// version with a recorded SUPERSEDES edge.
#[test]
fn test_up_version_resolves_dependencies_and_supersedes() {
    let world = world();
    let store = LocalFileStore::new(world._dir.path());

    let win = make_draft(&world, "WIN", "WIN-2026-0001", Uuid::new_v4());
    run_to_effective(&world, &store, &win);
    let pol = make_draft(&world, "POL", "POL-2026-0001", Uuid::new_v4());
    run_to_effective(&world, &store, &pol);

    let sop_family = Uuid::new_v4();
    let sop_v1 = make_draft(&world, "SOP", "SOP-2026-0001", sop_family);
    run_to_effective(&world, &store, &sop_v1);

    let deps = DependencyRepo::new(&world.db);
    deps.insert(&DocumentDependency {
        id: Uuid::new_v4(),
        source_document_id: sop_v1.id,
        target_document_id: win.id,
        dependency_type: DependencyType::Supports,
        is_critical: false,
        created_at: Utc::now(),
    })
    .unwrap();
    deps.insert(&DocumentDependency {
        id: Uuid::new_v4(),
        source_document_id: sop_v1.id,
        target_document_id: pol.id,
        dependency_type: DependencyType::Reference,
        is_critical: false,
        created_at: Utc::now(),
    })
    .unwrap();

    let engine = engine(&world, &store);
    let outcome = engine
        .start_version_workflow(
            world.author,
            sop_v1.id,
            VersionType::Minor,
            "clarify section 3".to_string(),
            "reworded section 3".to_string(),
            None,
            None,
        )
        .unwrap();
    assert!(outcome.warnings.is_empty());
    let sop_v2_id = outcome.new_document_id.unwrap();

    let copied = deps.by_source(sop_v2_id).unwrap();
    assert_eq!(copied.len(), 2);
    assert!(copied.iter().any(|d| d.target_document_id == win.id));
    assert!(copied.iter().any(|d| d.target_document_id == pol.id));

    let documents = DocumentRepo::new(&world.db);
    let sop_v2 = documents.get(sop_v2_id).unwrap();
    assert_eq!(sop_v2.status, DocumentStatus::Draft);

    run_to_effective(&world, &store, &sop_v2);

    let refreshed_v1 = documents.get(sop_v1.id).unwrap();
    assert_eq!(refreshed_v1.status, DocumentStatus::Superseded);

    let supersedes_edge = deps
        .by_source(sop_v2_id)
        .unwrap()
        .into_iter()
        .find(|d| d.dependency_type == DependencyType::Supersedes)
        .unwrap();
    assert_eq!(supersedes_edge.target_document_id, sop_v1.id);
}

/// Scenario 5: an effective document scheduled for obsolescence in the
/// future stays ScheduledForObsolescence until the scheduler's
/// process-obsoletion-dates task finds its target date has arrived.
#[test]
fn test_scheduler_processes_obsoletion_date() {
    let world = world();
    let store = LocalFileStore::new(world._dir.path());
    let doc = make_draft(&world, "SOP", "SOP-2026-0099", Uuid::new_v4());
    run_to_effective(&world, &store, &doc);

    let engine = engine(&world, &store);
    let tomorrow = Utc::now().date_naive() + chrono::Duration::days(3);
    let outcome = engine
        .schedule_obsolescence(world.approver, doc.id, tomorrow, "planned retirement".to_string())
        .unwrap();
    assert_eq!(outcome.new_state, Some(DocumentStatus::ScheduledForObsolescence));

    let documents = DocumentRepo::new(&world.db);
    assert_eq!(documents.get(doc.id).unwrap().status, DocumentStatus::ScheduledForObsolescence);

    // Simulate the target date having arrived without advancing the clock.
    let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
    world
        .db
        .with_connection(|conn| {
            conn.execute(
                "UPDATE documents SET obsolescence_date = ?1 WHERE id = ?2",
                rusqlite::params![yesterday.format("%Y-%m-%d").to_string(), doc.id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

    let scheduler = Scheduler::new(
        &world.db,
        qms_core::config::SchedulerConfig {
            beat_interval_seconds: 30,
            workflow_timeout_hours: 72,
        },
        &store,
        Arc::new(LoggingNotificationDispatcher),
        Uuid::nil(),
    );
    scheduler.run_task(Task::ProcessObsoletionDates);
    assert_eq!(documents.get(doc.id).unwrap().status, DocumentStatus::Obsolete);
}
