use fraud_detection_mlops::config::AppConfig;
use fraud_detection_mlops::preprocessing::{run_preprocessing, ProcessedData, StandardScaler, SCALER_FILE};
use std::fmt::Write as _;

fn write_csv(path: &std::path::Path, rows: usize) {
    let mut text = String::from("\"Time\",\"V1\",\"V2\",\"Amount\",\"Class\"\n");
    for i in 0..rows {
        let fraud = i % 5 == 0;
        let v = i as f64 / 10.0;
        writeln!(
            text,
            "{},{},{},{},\"{}\"",
            i * 3,
            if fraud { v + 5.0 } else { v },
            -v,
            10.0 + i as f64,
            u8::from(fraud)
        )
        .unwrap();
    }
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

#[test]
fn test_preprocessing_writes_loadable_split() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.data.raw_dir = dir.path().join("raw");
    config.data.processed_dir = dir.path().join("processed");
    write_csv(&config.data.raw_dataset_path(), 100);

    let processed = run_preprocessing(&config).unwrap();
    assert_eq!(processed.feature_names, vec!["V1", "V2", "Amount"]);
    assert_eq!(processed.y_train.len() + processed.y_test.len(), 100);
    assert_eq!(processed.y_test.len(), 20);
    // stratified: 20 frauds overall, 4 in the test split
    assert_eq!(processed.y_test.iter().filter(|&&y| y == 1).count(), 4);

    let loaded = ProcessedData::load(&config.data.processed_dir).unwrap();
    assert_eq!(loaded.x_train, processed.x_train);
    assert_eq!(loaded.y_test, processed.y_test);
    assert_eq!(loaded.feature_names, processed.feature_names);

    let scaler = StandardScaler::load_json(config.data.processed_dir.join(SCALER_FILE)).unwrap();
    assert_eq!(scaler.n_features(), 3);
    // training columns are centered after scaling
    for col in 0..3 {
        let mean: f64 =
            loaded.x_train.iter().map(|r| r[col]).sum::<f64>() / loaded.x_train.len() as f64;
        assert!(mean.abs() < 1e-9);
    }
}

#[test]
fn test_preprocessing_without_dataset_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.data.raw_dir = dir.path().join("raw");
    config.data.processed_dir = dir.path().join("processed");
    assert!(run_preprocessing(&config).is_err());
}
