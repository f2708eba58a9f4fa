//! Retry, paging and operator recovery.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use strand::backends::{InspectionBackend, MemoryBackend, SharedBackend};
use strand::failure::HopError;
use strand::prog::{Directive, FAIL_REASON_KEY, HopContext, Prog, ProgRegistry};
use strand::runtime::page_kinds;
use strand::strand::paused_until;
use strand::Engine;

use common::{FakeCloud, dispatcher, drain, frame, registry};

#[tokio::test]
async fn exhausted_retries_raise_exactly_one_page_and_halt() {
    let memory = MemoryBackend::new();
    let cloud = FakeCloud::default();
    cloud.fail_next(100);
    let registry = Arc::new(registry(&cloud));
    let backend: SharedBackend = Arc::new(memory.clone());
    let engine = Engine::new(backend.clone(), registry.clone());
    let dispatcher = dispatcher(backend, registry);
    let id = engine
        .create(
            "Subnet",
            "create",
            frame(json!({"name": "subnet-1", "location": "hetzner-hel1"})),
            None,
        )
        .await
        .expect("create");

    // Zero backoff: the strand retries immediately until the budget runs out.
    let now = Utc::now();
    assert_eq!(drain(&dispatcher, now).await, 4);
    assert_eq!(cloud.calls(), 4);

    let pages = engine.pages(true, 10).await.expect("pages");
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].details["kind"], json!(page_kinds::RETRIES_EXHAUSTED));
    assert_eq!(pages[0].details["label"], json!("create"));
    assert_eq!(pages[0].details["stack"][0]["data"]["name"], json!("subnet-1"));

    let strand = memory.get_strand(id).await.expect("get").expect("strand");
    assert!(strand.failed_at.is_some());
    assert!(strand.scheduled_at >= paused_until(now) - ChronoDuration::seconds(1));

    // Nothing runs it again, however far the clock moves short of the pause.
    let much_later = now + ChronoDuration::days(30);
    assert_eq!(dispatcher.tick_at(much_later).await.expect("tick").claimed, 0);
    assert_eq!(engine.pages(true, 10).await.expect("pages").len(), 1);

    // The operator fixes the host and resumes; the page resolves with it.
    cloud.fail_next(0);
    engine.resume(id, None).await.expect("resume");
    assert!(engine.pages(true, 10).await.expect("pages").is_empty());
    drain(&dispatcher, much_later).await;
    let strand = memory.get_strand(id).await.expect("get").expect("strand");
    assert_eq!(strand.exit_value.expect("exit")["id"], json!("subnet-1"));
}

#[tokio::test]
async fn fail_directive_is_modeled_and_never_pages() {
    let memory = MemoryBackend::new();
    let prog = Prog::builder("Disk")
        .label("start", |_: &mut HopContext| Ok(Directive::fail("no capacity on host")))
        .label("failed", |ctx: &mut HopContext| {
            let reason = ctx.get(FAIL_REASON_KEY).cloned().unwrap_or_default();
            Ok(Directive::exit(json!({"error": reason})))
        })
        .fail_label("failed")
        .build()
        .expect("prog");
    let registry = Arc::new(ProgRegistry::new().with(prog).expect("registry"));
    let backend: SharedBackend = Arc::new(memory.clone());
    let engine = Engine::new(backend.clone(), registry.clone());
    let dispatcher = dispatcher(backend, registry);
    let id = engine
        .create("Disk", "start", frame(json!({})), None)
        .await
        .expect("create");

    assert_eq!(drain(&dispatcher, Utc::now()).await, 2);
    let strand = memory.get_strand(id).await.expect("get").expect("strand");
    assert_eq!(
        strand.exit_value,
        Some(json!({"error": "no capacity on host"}))
    );
    assert!(memory.pages().is_empty());
}

#[tokio::test]
async fn unknown_label_and_panics_are_paged_not_retried() {
    let memory = MemoryBackend::new();
    let prog = Prog::builder("Host")
        .label("start", |_: &mut HopContext| Ok(Directive::hop("reboot")))
        .label("reboot", |_: &mut HopContext| -> Result<Directive, HopError> {
            panic!("virsh returned garbage")
        })
        .label("lost", |_: &mut HopContext| Ok(Directive::hop("nowhere")))
        .build()
        .expect("prog");
    let registry = Arc::new(ProgRegistry::new().with(prog).expect("registry"));
    let backend: SharedBackend = Arc::new(memory.clone());
    let engine = Engine::new(backend.clone(), registry.clone());
    let dispatcher = dispatcher(backend, registry);
    let panicking = engine
        .create("Host", "start", frame(json!({})), None)
        .await
        .expect("create");
    let misrouted = engine
        .create("Host", "lost", frame(json!({})), None)
        .await
        .expect("create");

    assert_eq!(drain(&dispatcher, Utc::now()).await, 3);

    let pages = memory.pages();
    assert_eq!(pages.len(), 2);
    let kind_for = |id| {
        pages
            .iter()
            .find(|page| page.strand_id == Some(id))
            .map(|page| page.details["kind"].clone())
    };
    assert_eq!(kind_for(panicking), Some(json!(page_kinds::PANIC)));
    assert_eq!(kind_for(misrouted), Some(json!(page_kinds::CONFIGURATION)));

    for id in [panicking, misrouted] {
        let strand = memory.get_strand(id).await.expect("get").expect("strand");
        assert!(strand.failed_at.is_some());
        assert_eq!(strand.retry_count, 0);
    }
}

#[tokio::test]
async fn deadline_without_cancel_label_pages() {
    let memory = MemoryBackend::new();
    let registry = Arc::new(registry(&FakeCloud::default()));
    let backend: SharedBackend = Arc::new(memory.clone());
    let engine = Engine::new(backend.clone(), registry.clone());
    let dispatcher = dispatcher(backend, registry);
    let now = Utc::now();
    let id = engine
        .create_strand(
            strand::NewStrand::new("Vm", "start", frame(json!({})))
                .with_deadline(now - ChronoDuration::seconds(1)),
        )
        .await
        .expect("create");

    assert_eq!(drain(&dispatcher, now).await, 1);
    let pages = memory.pages();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].details["kind"], json!(page_kinds::DEADLINE));
    let strand = memory.get_strand(id).await.expect("get").expect("strand");
    assert_eq!(strand.label, "start");
}

#[tokio::test]
async fn resume_after_missed_deadline_runs_the_chosen_label() {
    let memory = MemoryBackend::new();
    let registry = Arc::new(registry(&FakeCloud::default()));
    let backend: SharedBackend = Arc::new(memory.clone());
    let engine = Engine::new(backend.clone(), registry.clone());
    let dispatcher = dispatcher(backend, registry);
    let now = Utc::now();
    let id = engine
        .create_strand(
            strand::NewStrand::new("Vm", "start", frame(json!({})))
                .with_deadline(now - ChronoDuration::seconds(1)),
        )
        .await
        .expect("create");
    assert_eq!(drain(&dispatcher, now).await, 1);
    assert_eq!(engine.pages(true, 10).await.expect("pages").len(), 1);

    let resumed = engine.resume(id, Some("destroy")).await.expect("resume");
    assert!(resumed.deadline_at.is_none());
    assert_eq!(drain(&dispatcher, Utc::now()).await, 1);

    let strand = memory.get_strand(id).await.expect("get").expect("strand");
    assert_eq!(strand.exit_value, Some(json!({"destroyed": true})));
    assert!(strand.failed_at.is_none());
    assert_eq!(memory.pages().len(), 1);
    assert!(engine.pages(true, 10).await.expect("pages").is_empty());
}
