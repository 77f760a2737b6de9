use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("trl").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("PPO fine-tuning"));
}

#[test]
fn test_cli_config_prints_defaults() {
    let mut cmd = Command::cargo_bin("trl").unwrap();
    let output = cmd.arg("config").assert().success().get_output().stdout.clone();

    let config: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(config["batch_size"], 256);
    assert_eq!(config["forward_batch_size"], 16);
    assert_eq!(config["target"], 0.3);
}

#[test]
fn test_cli_train_writes_model() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("model");
    let metrics = dir.path().join("metrics.jsonl");

    let mut cmd = Command::cargo_bin("trl").unwrap();
    cmd.arg("train")
        .args(["--epochs", "2"])
        .args(["--batch-size", "4"])
        .args(["--forward-batch-size", "2"])
        .args(["--hidden-size", "8"])
        .args(["--seed", "3"])
        .arg("--no-progress")
        .arg("--output-dir")
        .arg(&output)
        .arg("--jsonl")
        .arg(&metrics)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete: 2 iterations"));

    assert!(output.join("model.safetensors").is_file());
    assert!(output.join("vocab.json").is_file());
    assert!(output.join("trainer_state.json").is_file());
    assert_eq!(std::fs::read_to_string(&metrics).unwrap().lines().count(), 2);
}

#[test]
fn test_cli_train_rejects_bad_batch_split() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("trl").unwrap();
    cmd.arg("train")
        .args(["--batch-size", "4"])
        .args(["--forward-batch-size", "3"])
        .arg("--output-dir")
        .arg(dir.path().join("model"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("forward_batch_size"));
}

#[test]
fn test_cli_train_with_prompt_file() {
    let dir = tempfile::tempdir().unwrap();
    let prompts = dir.path().join("prompts.txt");
    std::fs::write(&prompts, "a good day\nsuch a bad day\n\nthe best day\nthe worst day\n").unwrap();

    let mut cmd = Command::cargo_bin("trl").unwrap();
    cmd.arg("train")
        .args(["--epochs", "1", "--batch-size", "4", "--forward-batch-size", "4"])
        .args(["--hidden-size", "8"])
        .arg("--no-progress")
        .arg("--prompts")
        .arg(&prompts)
        .arg("--output-dir")
        .arg(dir.path().join("model"))
        .assert()
        .success();
}
