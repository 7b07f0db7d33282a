//! Synthetic credit-card-shaped fixture shared by the integration tests.
#![allow(dead_code)]

use fraud_detection_mlops::forest::{ClassWeight, ForestParams, RandomForestClassifier};
use fraud_detection_mlops::preprocessing::ProcessedData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const WIDTH: usize = 29;

/// `[1, -1, 2, -2, ..., 14, -14, 15]`
pub fn suspicious_vector() -> Vec<f64> {
    (0..WIDTH)
        .map(|i| {
            let magnitude = (i / 2 + 1) as f64;
            if i % 2 == 0 {
                magnitude
            } else {
                -magnitude
            }
        })
        .collect()
}

/// Legitimate rows sit within ±0.3 of zero, fraud rows within ±0.3 of the
/// suspicious vector. Every tenth row is fraud.
pub fn synthetic_rows(n: usize, seed: u64) -> (Vec<Vec<f64>>, Vec<u8>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let fraud_center = suspicious_vector();
    let mut rows = Vec::with_capacity(n);
    let mut labels = Vec::with_capacity(n);

    for i in 0..n {
        let fraud = i % 10 == 0;
        let row = (0..WIDTH)
            .map(|j| {
                let center = if fraud { fraud_center[j] } else { 0.0 };
                center + rng.gen_range(-0.3..0.3)
            })
            .collect();
        rows.push(row);
        labels.push(u8::from(fraud));
    }
    (rows, labels)
}

pub fn small_params() -> ForestParams {
    ForestParams {
        n_estimators: 15,
        max_depth: Some(6),
        min_samples_split: 2,
        min_samples_leaf: 1,
        class_weight: ClassWeight::Balanced,
    }
}

pub fn trained_model() -> RandomForestClassifier {
    let (x, y) = synthetic_rows(300, 7);
    RandomForestClassifier::fit(&small_params(), 42, &x, &y).unwrap()
}

pub fn feature_names() -> Vec<String> {
    let mut names: Vec<String> = (1..=28).map(|i| format!("V{i}")).collect();
    names.push("Amount".to_string());
    names
}

pub fn processed_data() -> ProcessedData {
    let (x_train, y_train) = synthetic_rows(400, 1);
    let (x_test, y_test) = synthetic_rows(100, 2);
    ProcessedData {
        x_train,
        x_test,
        y_train,
        y_test,
        feature_names: feature_names(),
    }
}
