// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_st-unlearn-cli"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn write_overrides(dir: &Path) -> String {
    let path = dir.join("run.json");
    fs::write(&path, r#"{"seed": 3, "dataset": {"name": "cifar10"}}"#).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn aus_reads_the_registry() {
    let dir = tempdir().unwrap();
    let registry = dir.path().join("metrics.json");
    fs::write(
        &registry,
        r#"{
  "datasets": {
    "cifar10": {
      "original_model": [{"forgetting_set": [0, 3], "accuracy_retain": 90.0}],
      "unlearning_methods": [{
        "method_name": "scrub",
        "cases": [{"forgetting_set": "[0, 3]", "accuracy_retain": 85.0, "accuracy_forget": 10.0}]
      }]
    }
  }
}"#,
    )
    .unwrap();
    let overrides = write_overrides(dir.path());

    let output = run_cli(&[
        "--overrides",
        &overrides,
        "--registry",
        registry.to_str().unwrap(),
        "aus",
        "--method",
        "scrub",
        "--forgetting-set",
        "[0, 3]",
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let score: f64 = stdout.lines().last().unwrap().trim().parse().unwrap();
    assert!((score - 95.0 / 110.0).abs() < 1e-6);
}

#[test]
fn aus_fails_for_unknown_cases() {
    let dir = tempdir().unwrap();
    let overrides = write_overrides(dir.path());
    let registry = dir.path().join("missing.json");
    let output = run_cli(&[
        "--overrides",
        &overrides,
        "--registry",
        registry.to_str().unwrap(),
        "aus",
        "--method",
        "badT",
        "--forgetting-set",
        "[1]",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stderr).unwrap().contains("error:"));
}

#[test]
fn run_rejects_malformed_datasets() {
    let dir = tempdir().unwrap();
    let overrides = write_overrides(dir.path());
    let train = dir.path().join("train.json");
    fs::write(&train, r#"{"rows": 2, "cols": 3, "data": [1.0, 2.0], "labels": [0, 1]}"#).unwrap();
    let registry = dir.path().join("metrics.json");

    let output = run_cli(&[
        "--overrides",
        &overrides,
        "--registry",
        registry.to_str().unwrap(),
        "run",
        "--from-scratch",
        "--train",
        train.to_str().unwrap(),
        "--test",
        train.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stderr)
        .unwrap()
        .contains("expected 6 (rows * cols)"));
    assert!(!registry.exists());
}

#[test]
fn run_rejects_unknown_methods() {
    let dir = tempdir().unwrap();
    let overrides = write_overrides(dir.path());
    let output = run_cli(&[
        "--overrides",
        &overrides,
        "run",
        "--from-scratch",
        "--method",
        "ssd",
        "--train",
        "unused.json",
        "--test",
        "unused.json",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stderr).unwrap().contains("ssd"));
}
