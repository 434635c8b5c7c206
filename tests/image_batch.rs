//! Image generation batches share the runner and ledger with extraction

mod common;

use common::create_test_store;
use narrex::checkpoint::CheckpointStatus;
use narrex::image::load_prompts;
use narrex::{BatchRunner, CharacterPrompt, CheckpointStore, FailedPolicy, ImageJob, MockImageBackend};
use std::sync::Arc;
use tempfile::tempdir;

fn prompts() -> Vec<CharacterPrompt> {
    vec![
        CharacterPrompt {
            name: "林动".into(),
            prompt: "young martial artist, black robe".into(),
        },
        CharacterPrompt {
            name: "Elder/Mo".into(),
            prompt: "forbidden pose".into(),
        },
        CharacterPrompt {
            name: "绫清竹".into(),
            prompt: "swordswoman in white".into(),
        },
    ]
}

#[tokio::test]
async fn rejected_prompt_fails_alone_and_rerun_skips_done() {
    let out = tempdir().unwrap();
    let backend = Arc::new(MockImageBackend::available().with_rejection_for("forbidden"));
    let job = Arc::new(ImageJob::new(backend.clone(), out.path()).with_images_per_character(2));
    let store = create_test_store();

    let stats = BatchRunner::new(store.clone(), FailedPolicy::Skip)
        .with_file_concurrency(2)
        .run(job.clone(), prompts())
        .await
        .unwrap();

    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
    assert!(out.path().join("林动").join("image_001.png").exists());
    assert!(out.path().join("林动").join("image_002.png").exists());
    assert!(!out.path().join("Elder_Mo").exists());

    let rejected = store.entry("Elder/Mo").unwrap().unwrap();
    assert_eq!(rejected.status, CheckpointStatus::Failed);
    assert!(rejected.reason.unwrap().starts_with("collaborator_refusal"));

    let row = store.entry("绫清竹").unwrap().unwrap().row.unwrap();
    assert_eq!(row["images"].as_array().unwrap().len(), 2);

    let rerun = BatchRunner::new(store, FailedPolicy::Skip)
        .run(job, prompts())
        .await
        .unwrap();
    assert_eq!(rerun.skipped, 3);
    assert_eq!(rerun.processed, 0);
    assert_eq!(backend.calls(), 3);
    assert!(!out.path().join("林动").join("image_003.png").exists());
}

#[tokio::test]
async fn unavailable_backend_fails_every_prompt() {
    let out = tempdir().unwrap();
    let job = Arc::new(ImageJob::new(Arc::new(MockImageBackend::unavailable()), out.path()));
    let store = create_test_store();

    let stats = BatchRunner::new(store.clone(), FailedPolicy::Retry)
        .run(job, prompts())
        .await
        .unwrap();

    assert_eq!(stats.failed, 3);
    assert_eq!(store.counts().unwrap().failed, 3);
}

#[test]
fn prompts_load_from_json_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("characters.json");
    std::fs::write(
        &path,
        r#"[{"name": "林动", "prompt": "martial artist"}, {"name": "小貂", "prompt": "white marten"}]"#,
    )
    .unwrap();

    let loaded = load_prompts(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].name, "小貂");
}
