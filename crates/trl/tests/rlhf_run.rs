use candle_core::{Device, Tensor};
use std::fs;
use trl::checkpoint::{load_var_map, MODEL_FILE, STATE_FILE, VOCAB_FILE};
use trl::prelude::*;

const PROMPTS: [&str; 8] = [
    "the movie was",
    "this film is",
    "i thought it",
    "the acting was",
    "overall it was",
    "the plot felt",
    "my friends said",
    "the ending was",
];

fn prompts() -> Vec<String> {
    PROMPTS.iter().map(|s| s.to_string()).collect()
}

fn build(config: TrainerConfig) -> RlhfRunner<TinyCausalLm, TinyCausalLm> {
    let tokenizer =
        CharTokenizer::from_corpus(PROMPTS.iter().copied().chain(["abcdefghijklmnopqrstuvwxyz"]));
    let lm = TinyLmConfig {
        vocab_size: tokenizer.vocab_size(),
        hidden_size: 16,
        ..Default::default()
    };
    let policy = TinyCausalLm::new(lm, &Device::Cpu).unwrap();
    let reference = policy.frozen_copy().unwrap();
    let trainer = PpoTrainer::new(policy, reference, config).unwrap();
    let sampler = MultinomialSampler::new(SamplerConfig {
        seed: 11,
        ..Default::default()
    });

    RlhfRunner::new(
        trainer,
        Box::new(sampler),
        Box::new(LexiconSentiment::default()),
        Box::new(tokenizer),
    )
    .unwrap()
}

fn config(data_dir: &str) -> TrainerConfig {
    let mut config = TrainerConfig::default()
        .with_batch_size(4, 2)
        .with_lengths(4, 6)
        .with_epochs(3)
        .with_ppo_epochs(2)
        .with_lr(1e-3)
        .with_seed(5);
    config.checkpoint_interval = 1;
    config.data_dir = data_dir.to_string();
    config
}

#[test]
fn test_full_run_logs_checkpoints_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt_dir = dir.path().join("ckpt");
    let metrics = dir.path().join("metrics.jsonl");
    let export = dir.path().join("model");

    let mut runner = build(config(ckpt_dir.to_str().unwrap()))
        .with_logger(Box::new(JsonLinesLogger::new(&metrics).unwrap()));
    let summary = runner.run(&prompts()).unwrap();

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.mean_rewards.len(), 3);
    assert!(summary.mean_rewards.iter().all(|r| r.is_finite()));
    assert!(summary.final_kl_coef > 0.0);

    // one JSON record per iteration, each carrying the full stats map
    let lines: Vec<serde_json::Value> = fs::read_to_string(&metrics)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    for (i, record) in lines.iter().enumerate() {
        assert_eq!(record["step"], (i + 1) as u64);
        let stats = &record["stats"];
        assert!(stats["objective/kl"].is_number());
        assert!(stats["env/reward_mean"].is_number());
        assert!(stats["objective/kl_dist"].is_array());
        assert!(stats["time/epoch"].is_number());
    }

    for iteration in 1..=3 {
        let ckpt = ckpt_dir.join(format!("checkpoint_iter_{iteration:06}"));
        assert!(ckpt.join(MODEL_FILE).is_file(), "{}", ckpt.display());
        assert!(ckpt.join(STATE_FILE).is_file());
    }
    assert!(ckpt_dir.join("checkpoint_best").is_dir());

    runner.save_pretrained(&export).unwrap();
    assert!(export.join(VOCAB_FILE).is_file());

    let state = TrainerState::load(&export).unwrap();
    assert_eq!(state.iteration, 3);
    assert_eq!(state.mean_reward, summary.mean_rewards.last().copied());
    assert!((state.kl_coef - summary.final_kl_coef).abs() < 1e-12);
    assert_eq!(state.config.batch_size, 4);

    // the exported artifact reproduces the trained policy
    let tokenizer = CharTokenizer::load(export.join(VOCAB_FILE)).unwrap();
    let lm = TinyLmConfig {
        vocab_size: tokenizer.vocab_size(),
        hidden_size: 16,
        ..Default::default()
    };
    let reloaded = TinyCausalLm::new(lm, &Device::Cpu).unwrap();
    load_var_map(reloaded.var_map(), export.join(MODEL_FILE)).unwrap();

    let ids = tokenizer.encode("the movie").unwrap();
    let len = ids.len();
    let ids = Tensor::from_vec(ids, (1, len), &Device::Cpu).unwrap();
    let trained = runner.trainer().policy().forward(&ids).unwrap().logits;
    let restored = reloaded.forward(&ids).unwrap().logits;
    assert_eq!(
        trained.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        restored.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    );
}

#[test]
fn test_resume_from_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt_dir = dir.path().join("ckpt");
    let data_dir = ckpt_dir.to_str().unwrap();

    let mut runner = build(config(data_dir));
    runner.run(&prompts()).unwrap();
    let kl_coef = runner.trainer().kl_coef();

    let manager = CheckpointManager::new(CheckpointConfig::new(&ckpt_dir)).unwrap();
    let mut fresh = build(config(data_dir)).into_trainer();
    assert_eq!(manager.load_latest(&mut fresh).unwrap(), Some(3));
    assert_eq!(fresh.iteration(), 3);
    assert!((fresh.kl_coef() - kl_coef).abs() < 1e-12);
}
