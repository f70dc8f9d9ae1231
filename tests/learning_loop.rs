//! End-to-end tests for the continuous learning loop

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::sleep;

use qfusion::config::FusionConfig;
use qfusion::data::{DataCollector, StaticSource};
use qfusion::error::FusionError;
use qfusion::learning::{ContinuousLearner, LoopState};
use qfusion::model::{FusionModel, Matrix};
use qfusion::store::PersistentStore;

fn test_config(dir: &tempfile::TempDir) -> FusionConfig {
    FusionConfig {
        database_path: dir.path().join("test.db"),
        // Long enough that only the immediate first cycle runs per test
        update_interval_secs: 300,
        batch_size: 4,
        ..Default::default()
    }
}

async fn build_learner(
    config: &FusionConfig,
    collector: DataCollector,
) -> (Arc<ContinuousLearner>, Arc<PersistentStore>) {
    let store = Arc::new(PersistentStore::new(&config.database_path).await.unwrap());
    let model = FusionModel::new(config.hyperparams()).unwrap();
    let learner = Arc::new(ContinuousLearner::new(
        Arc::new(RwLock::new(model)),
        store.clone(),
        Arc::new(collector),
        config,
    ));
    (learner, store)
}

#[tokio::test]
async fn test_empty_cycle_trains_nothing_and_stops_clean() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let (learner, store) = build_learner(&config, DataCollector::disconnected()).await;

    let handle = learner.clone().spawn();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(learner.state(), LoopState::Running);

    learner.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(learner.state(), LoopState::Stopped);

    // An empty cycle persists nothing and writes no checkpoint
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.total_checkpoints, 0);
}

#[tokio::test]
async fn test_productive_cycle_persists_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let collector = DataCollector::new(vec![Box::new(StaticSource::new(
        "test",
        "Quantum circuits encode inputs as rotations.\n\
         Dense layers learn the rest.",
    ))]);
    let (learner, store) = build_learner(&config, collector).await;

    let handle = learner.clone().spawn();
    sleep(Duration::from_millis(500)).await;
    learner.stop();
    handle.await.unwrap().unwrap();

    let entries = store.retrieve(Some("training_data"), 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, "training_data");
    // Preprocessing lowercases the collected text before persisting
    let text = entries[0].content["text"].as_str().unwrap();
    assert!(text.contains("quantum circuits"));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_checkpoints, 1);
}

#[tokio::test]
async fn test_checkpoint_resume_preserves_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let collector = DataCollector::new(vec![Box::new(StaticSource::new(
        "test",
        "One sentence of training data.",
    ))]);
    let (learner, store) = build_learner(&config, collector).await;

    let handle = learner.clone().spawn();
    sleep(Duration::from_millis(500)).await;
    learner.stop();
    handle.await.unwrap().unwrap();

    let (_, state, optimizer) = store.load_latest_checkpoint().await.unwrap().unwrap();
    let restored = FusionModel::load_state_with_optimizer(state, optimizer).unwrap();

    let input = Matrix::row(&[0.3, 0.7]);
    let expected = restored.predict(&input).unwrap();
    // Restoring the same checkpoint twice yields identical predictions: the
    // simulator is seeded, so inference is deterministic
    let (_, state, optimizer) = store.load_latest_checkpoint().await.unwrap().unwrap();
    let again = FusionModel::load_state_with_optimizer(state, optimizer).unwrap();
    let actual = again.predict(&input).unwrap();

    for (e, a) in expected.as_slice().iter().zip(actual.as_slice()) {
        assert!((e - a).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_stop_is_idempotent_and_loop_reports_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let (learner, _) = build_learner(&config, DataCollector::disconnected()).await;

    assert_eq!(learner.state(), LoopState::Idle);
    let handle = learner.clone().spawn();
    sleep(Duration::from_millis(100)).await;

    learner.stop();
    learner.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(learner.state(), LoopState::Stopped);
}

#[tokio::test]
async fn test_cycle_failure_faults_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let collector = DataCollector::new(vec![Box::new(StaticSource::new(
        "test",
        "Data the store can no longer accept.",
    ))]);
    let (learner, _store) = build_learner(&config, collector).await;

    // Pull the entry log out from under the loop; the first cycle's insert
    // then fails with a storage error.
    let conn = rusqlite::Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("DROP TABLE entries", []).unwrap();

    let handle = learner.clone().spawn();
    let result = handle.await.unwrap();
    assert!(
        matches!(result, Err(FusionError::LoopFault(_))),
        "expected a loop fault, got {result:?}"
    );
    assert_eq!(learner.state(), LoopState::Faulted);
}

#[tokio::test]
async fn test_checkpoint_pruning_bounds_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.checkpoint_keep_last = 2;
    // Short interval so several cycles fit in the test window
    config.update_interval_secs = 1;
    let collector = DataCollector::new(vec![Box::new(StaticSource::new(
        "test",
        "Fresh data every cycle.",
    ))]);
    let (learner, store) = build_learner(&config, collector).await;

    let handle = learner.clone().spawn();
    sleep(Duration::from_millis(3500)).await;
    learner.stop();
    handle.await.unwrap().unwrap();

    let checkpoints = store.list_checkpoints().await.unwrap();
    assert!(!checkpoints.is_empty());
    assert!(checkpoints.len() <= 2);
}
