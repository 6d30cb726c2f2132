use serde_json::{Value, json};

use crate::core::database::tests::init_database_for_tests;
use crate::core::experiments::*;

fn spec(value: Value) -> ExperimentSpec {
  serde_json::from_value(value).unwrap()
}

fn mnist() -> ExperimentSpec {
  spec(json!({
    "experiment_name": "mnist",
    "duree": "2:00:00",
    "mem": "4000",
    "env": "THEANO_FLAGS=floatX=float32",
    "clusters": {
      "guillimin": { "root": "/scratch/mnist", "max_running": 20, "max_queued": 0 },
      "helios": {
        "root": "/home/mnist",
        "max_running": 5,
        "max_queued": 100,
        "duree": "12:00:00",
        "mem": "null",
        "queue": "gpu",
      },
    },
  }))
}

#[test]
fn save_creates_and_resolves_inherited_hints() {
  let (_dir, db) = init_database_for_tests();
  let experiment = save_experiment(&db, &mnist()).unwrap();
  assert_eq!(experiment.name, "mnist");
  assert_eq!(experiment.table, "mnist_jobs");

  let guillimin = &experiment.clusters["guillimin"];
  assert_eq!(guillimin.duree, "2:00:00");
  assert_eq!(guillimin.mem, "4000");
  assert_eq!(guillimin.max_running, 20);

  let helios = &experiment.clusters["helios"];
  assert_eq!(helios.duree, "12:00:00");
  assert_eq!(helios.mem, "4000");
  assert_eq!(helios.extra.get("queue"), Some(&json!("gpu")));

  // The stored row keeps the inherit marker.
  let stored = db.load(EXPERIMENTS_TABLE, None, Some(experiment.id)).unwrap();
  assert_eq!(stored[0].get("clusters.guillimin.duree"), Some(&json!(INHERIT)));
}

#[test]
fn missing_required_cluster_options_are_rejected() {
  let (_dir, db) = init_database_for_tests();
  let incomplete = spec(json!({
    "name": "mnist",
    "duree": "1:00:00", "mem": "1000", "env": "",
    "clusters": { "guillimin": { "root": "/scratch", "max_running": 20 } },
  }));
  match save_experiment(&db, &incomplete) {
    Err(ExperimentError::MissingClusterOptions { cluster, missing }) => {
      assert_eq!(cluster, "guillimin");
      assert_eq!(missing, vec!["max_queued".to_string()]);
    }
    other => panic!("unexpected result: {:?}", other),
  }
  assert!(db.load(EXPERIMENTS_TABLE, None, None).unwrap().is_empty());
}

#[test]
fn hints_missing_everywhere_are_rejected() {
  let (_dir, db) = init_database_for_tests();
  let incomplete = spec(json!({
    "name": "mnist",
    "duree": "1:00:00",
    "clusters": {
      "guillimin": { "root": "/scratch", "max_running": 20, "max_queued": 0, "mem": "null", "env": "" },
    },
  }));
  match save_experiment(&db, &incomplete) {
    Err(ExperimentError::MissingDefaults { missing, .. }) => {
      assert_eq!(missing, vec!["mem".to_string()]);
    }
    other => panic!("unexpected result: {:?}", other),
  }
}

#[test]
fn saving_again_merges_into_the_stored_experiment() {
  let (_dir, db) = init_database_for_tests();
  let first = save_experiment(&db, &mnist()).unwrap();

  let update = spec(json!({
    "name": "mnist",
    "table": "ignored_jobs",
    "gpu": true,
    "clusters": {
      "guillimin": { "root": "/scratch/mnist", "max_running": 40, "max_queued": 0 },
    },
  }));
  let merged = save_experiment(&db, &update).unwrap();
  assert_eq!(merged.id, first.id);
  assert_eq!(merged.table, "mnist_jobs");
  assert!(merged.gpu);
  assert_eq!(merged.clusters["guillimin"].max_running, 40);
  assert_eq!(merged.clusters["guillimin"].duree, "2:00:00");
  assert_eq!(merged.clusters["helios"], first.clusters["helios"]);
  assert_eq!(db.load(EXPERIMENTS_TABLE, None, None).unwrap().len(), 1);
}

#[test]
fn saving_again_without_clusters_keeps_them() {
  let (_dir, db) = init_database_for_tests();
  let mut first = mnist();
  first.gpu = Some(true);
  let first = save_experiment(&db, &first).unwrap();

  let merged = save_experiment(&db, &spec(json!({ "name": "mnist", "mem": "8000" }))).unwrap();
  assert_eq!(merged.id, first.id);
  assert!(merged.gpu);
  assert_eq!(merged.clusters.len(), 2);
  assert_eq!(merged.clusters["guillimin"].mem, "8000");
  assert_eq!(merged.clusters["helios"].duree, "12:00:00");
  assert_eq!(merged.clusters["helios"].extra.get("queue"), Some(&json!("gpu")));
}

#[test]
fn partial_cluster_update_keeps_its_other_options() {
  let (_dir, db) = init_database_for_tests();
  save_experiment(&db, &mnist()).unwrap();

  let update = spec(json!({
    "name": "mnist",
    "clusters": { "helios": { "max_running": 8 } },
  }));
  let merged = save_experiment(&db, &update).unwrap();
  let helios = &merged.clusters["helios"];
  assert_eq!(helios.max_running, 8);
  assert_eq!(helios.max_queued, 100);
  assert_eq!(helios.root, "/home/mnist");
  assert_eq!(helios.duree, "12:00:00");
  assert_eq!(helios.mem, "4000");
  assert_eq!(merged.clusters["guillimin"].max_running, 20);
}

#[test]
fn load_filters_by_cluster_and_name() {
  let (_dir, db) = init_database_for_tests();
  save_experiment(&db, &mnist()).unwrap();
  let mut other = mnist();
  other.name = "cifar".to_string();
  other.clusters.remove("helios");
  save_experiment(&db, &other).unwrap();

  assert_eq!(load_experiments(&db, None, None).unwrap().len(), 2);
  let on_helios = load_experiments(&db, Some("helios"), None).unwrap();
  assert_eq!(on_helios.len(), 1);
  assert_eq!(on_helios[0].name, "mnist");

  assert_eq!(load_experiment(&db, "cifar").unwrap().table, "cifar_jobs");
  assert!(matches!(
    load_experiment(&db, "imagenet"),
    Err(ExperimentError::NotFound(_))
  ));
}

#[test]
fn invalid_experiment_names_are_rejected() {
  let (_dir, db) = init_database_for_tests();
  let mut bad = mnist();
  bad.name = "mnist-v2".to_string();
  assert!(matches!(
    save_experiment(&db, &bad),
    Err(ExperimentError::StorageError(_))
  ));
}

#[test]
fn update_and_delete_do_not_touch_jobs() {
  let (_dir, db) = init_database_for_tests();
  let experiment = save_experiment(&db, &mnist()).unwrap();
  db.save(&experiment.table, json!({ "seed": 1 })).unwrap();

  let report = update_experiments(&db, &[experiment.clone()], json!({ "gpu": true })).unwrap();
  assert!(report.all_succeeded());
  assert!(load_experiment(&db, "mnist").unwrap().gpu);

  let report = delete_experiments(&db, &[experiment.clone()]).unwrap();
  assert_eq!(report.succeeded(), vec![experiment.id]);
  assert!(load_experiments(&db, None, None).unwrap().is_empty());
  assert_eq!(db.load(&experiment.table, None, None).unwrap().len(), 1);
}
