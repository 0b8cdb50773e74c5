use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use attrgen::clients::{ClientError, CompletionClient, CompletionRequest};
use attrgen::config::GenerationConfig;
use attrgen::keys::{ApiKey, KeyPool};
use attrgen::llm::LlmCaller;
use attrgen::pipeline::Pipeline;
use attrgen::retry::RetryPolicy;
use attrgen::AttributeSet;

/// Deterministic stand-in for the hosted model that also records concurrency per key.
#[derive(Default)]
struct FakeModel {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak_in_flight: Mutex<HashMap<String, usize>>,
    failing_objects: HashSet<String>,
    revoke_after: Option<usize>,
}

impl FakeModel {
    fn failing(objects: &[&str]) -> Self {
        Self {
            failing_objects: objects.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Every call after the first `calls` is rejected as unauthorized.
    fn revoking_after(calls: usize) -> Self {
        Self {
            revoke_after: Some(calls),
            ..Default::default()
        }
    }

    fn prompts_mentioning(&self, object: &str) -> usize {
        let needle = format!("\"{}\"", object);
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(&needle))
            .count()
    }
}

#[async_trait]
impl CompletionClient for FakeModel {
    async fn complete(
        &self,
        request: &CompletionRequest,
        key: &ApiKey,
    ) -> Result<String, ClientError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(request.user_prompt.clone());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let current = in_flight.entry(key.name.clone()).or_default();
            *current += 1;
            let mut peak = self.peak_in_flight.lock().unwrap();
            let p = peak.entry(key.name.clone()).or_default();
            *p = (*p).max(*current);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(current) = in_flight.get_mut(&key.name) {
                *current -= 1;
            }
        }

        if self.revoke_after.is_some_and(|limit| call > limit) {
            return Err(ClientError::Unauthorized { status: 401 });
        }
        let prompt = &request.user_prompt;
        if self
            .failing_objects
            .iter()
            .any(|o| prompt.contains(&format!("\"{}\"", o)))
        {
            return Err(ClientError::Status {
                status: 503,
                body: "overloaded".to_string(),
                retry_after: None,
            });
        }
        if prompt.contains("attribute concepts") {
            Ok(r#"["color", "material", "size"]"#.to_string())
        } else {
            Ok("```json\n[\"alpha\", \"beta\", \"gamma\"]\n```".to_string())
        }
    }
}

fn write_objects(dir: &Path, objects: &[&str]) -> std::path::PathBuf {
    let path = dir.join("objects.json");
    std::fs::write(&path, serde_json::to_string(objects).unwrap()).unwrap();
    path
}

fn test_config(dir: &Path) -> GenerationConfig {
    GenerationConfig {
        input_file: dir.join("objects.json"),
        output_file: dir.join("out").join("attributes.json"),
        max_concurrent_per_key: 2,
        max_retries: 1,
        concepts_per_object: 2,
        values_per_concept: 2,
        save_every: 3,
        ..Default::default()
    }
}

fn pipeline(config: GenerationConfig, model: Arc<FakeModel>, key_count: usize) -> Pipeline {
    let keys = (0..key_count)
        .map(|i| ApiKey::new(format!("key-{}", i), format!("sk-test-{:08}", i)))
        .collect();
    let pool = KeyPool::new(keys, config.max_concurrent_per_key, None).unwrap();
    let caller = LlmCaller::new(model, Arc::new(pool), &config)
        .with_policy(RetryPolicy::immediate(config.max_retries));
    Pipeline::new(config, caller)
}

#[tokio::test]
async fn generates_concepts_then_values() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(dir.path(), &["apple", "chair", "lamp"]);
    let config = test_config(dir.path());
    let output = config.output_file.clone();
    let model = Arc::new(FakeModel::default());

    let stats = pipeline(config, Arc::clone(&model), 2).run().await.unwrap();

    assert_eq!(stats.objects_total, 3);
    assert_eq!(stats.concepts.requested, 3);
    assert_eq!(stats.concepts.succeeded, 3);
    assert_eq!(stats.values.requested, 6);
    assert_eq!(stats.values.succeeded, 6);
    assert_eq!(stats.total_failed(), 0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 9);

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(
        written["apple"],
        serde_json::json!({"color": ["alpha", "beta"], "material": ["alpha", "beta"]})
    );
    assert!(written.get("chair").is_some());
    assert!(!output.with_extension("json.tmp").exists());
}

#[tokio::test]
async fn never_exceeds_per_key_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let objects: Vec<String> = (0..24).map(|i| format!("object-{}", i)).collect();
    let names: Vec<&str> = objects.iter().map(String::as_str).collect();
    write_objects(dir.path(), &names);
    let model = Arc::new(FakeModel::default());

    pipeline(test_config(dir.path()), Arc::clone(&model), 3)
        .run()
        .await
        .unwrap();

    let peak = model.peak_in_flight.lock().unwrap();
    assert_eq!(peak.len(), 3, "every key should have been used: {:?}", peak);
    assert!(peak.values().all(|&p| p <= 2), "peak per key: {:?}", peak);
}

#[tokio::test]
async fn failed_objects_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(dir.path(), &["apple", "broken", "chair"]);
    let config = test_config(dir.path());
    let output = config.output_file.clone();
    let model = Arc::new(FakeModel::failing(&["broken"]));

    let stats = pipeline(config, Arc::clone(&model), 1).run().await.unwrap();

    assert_eq!(stats.concepts.failed, 1);
    assert_eq!(stats.concepts.succeeded, 2);
    // One attempt plus max_retries (1) retries
    assert_eq!(model.prompts_mentioning("broken"), 2);

    let set = AttributeSet::load(&output).unwrap();
    assert!(!set.has_concepts("broken"));
    assert!(set.has_concepts("apple"));
}

#[tokio::test]
async fn losing_every_key_saves_progress_and_aborts() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(dir.path(), &["apple", "chair", "lamp"]);
    let config = GenerationConfig {
        max_concurrent_per_key: 1,
        save_every: 0,
        ..test_config(dir.path())
    };
    let output = config.output_file.clone();
    let model = Arc::new(FakeModel::revoking_after(2));

    let err = pipeline(config, Arc::clone(&model), 1)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        attrgen::AttrGenError::NoUsableKeys { disabled: 1 }
    ));
    let set = AttributeSet::load(&output).unwrap();
    assert!(set.has_concepts("apple"));
    assert!(set.has_concepts("chair"));
    assert!(!set.has_concepts("lamp"));
    assert_eq!(model.prompts_mentioning("lamp"), 1);
}

#[tokio::test]
async fn resumes_from_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(dir.path(), &["apple", "chair"]);
    let config = test_config(dir.path());

    let mut existing = AttributeSet::new();
    existing.set_concepts("apple", vec!["color".into(), "taste".into()]);
    existing.set_values("apple", "color", vec!["red".into()]);
    existing.save(&config.output_file).unwrap();

    let output = config.output_file.clone();
    let model = Arc::new(FakeModel::default());
    let stats = pipeline(config, Arc::clone(&model), 1).run().await.unwrap();

    assert_eq!(stats.concepts.skipped, 1);
    assert_eq!(stats.concepts.requested, 1);
    // apple/taste and chair's two concepts still needed values
    assert_eq!(stats.values.requested, 3);
    assert_eq!(stats.values.skipped, 1);

    let set = AttributeSet::load(&output).unwrap();
    assert_eq!(set.values("apple", "color"), Some(&["red".to_string()][..]));
    assert_eq!(set.values("apple", "taste").map(<[String]>::len), Some(2));
}

#[tokio::test]
async fn value_only_run_uses_existing_output_when_input_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config = GenerationConfig {
        run_concept_generation: false,
        ..test_config(dir.path())
    };
    let mut existing = AttributeSet::new();
    existing.set_concepts("kettle", vec!["finish".into()]);
    existing.save(&config.output_file).unwrap();

    let output = config.output_file.clone();
    let model = Arc::new(FakeModel::default());
    let stats = pipeline(config, Arc::clone(&model), 1).run().await.unwrap();

    assert_eq!(stats.concepts.requested, 0);
    assert_eq!(stats.values.succeeded, 1);
    let set = AttributeSet::load(&output).unwrap();
    assert_eq!(
        set.values("kettle", "finish"),
        Some(&["alpha".to_string(), "beta".to_string()][..])
    );
}

#[tokio::test]
async fn limit_restricts_objects() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(dir.path(), &["a-obj", "b-obj", "c-obj"]);
    let config = GenerationConfig {
        run_value_generation: false,
        ..test_config(dir.path())
    };
    let model = Arc::new(FakeModel::default());

    let stats = pipeline(config, Arc::clone(&model), 1)
        .with_limit(Some(2))
        .run()
        .await
        .unwrap();

    assert_eq!(stats.objects_total, 2);
    assert_eq!(model.prompts_mentioning("c-obj"), 0);
}

#[tokio::test]
async fn missing_input_is_fatal_for_concept_runs() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(FakeModel::default());
    let err = pipeline(test_config(dir.path()), model, 1)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, attrgen::AttrGenError::Io { .. }));
}
