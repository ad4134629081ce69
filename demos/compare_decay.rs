//! Compare FIM memory decay settings on the same data and seed

use fedfim::checkpoint::MemoryCheckpointSink;
use fedfim::config::DataConfig;
use fedfim::{ExperimentConfig, Orchestrator, RoundLog};

fn main() -> Result<(), fedfim::FedError> {
    println!("Comparing FIM memory decay (gamma)\n");
    println!("Scenario: 5 clients, 6 rounds, lambda = 1.0\n");

    let base = ExperimentConfig {
        rounds: 6,
        num_clients: 5,
        batch_size: 16,
        fim_lambda: 1.0,
        hidden_sizes: vec![32],
        data: DataConfig {
            num_classes: 5,
            num_features: 16,
            samples_per_class: 100,
            test_samples_per_class: 40,
            cluster_spread: 2.0,
            ..Default::default()
        },
        ..Default::default()
    };

    for (label, gamma) in [
        ("gamma = 0.0 (no memory)", 0.0),
        ("gamma = 0.5", 0.5),
        ("gamma = 0.9 (long memory)", 0.9),
    ] {
        let mut orchestrator = Orchestrator::from_config(ExperimentConfig {
            fim_decay: gamma,
            ..base.clone()
        })?;
        let mut log = RoundLog::new();
        let last = orchestrator.run(&mut log, &mut MemoryCheckpointSink::default())?;
        let fim_total: f32 = orchestrator.global_fim().values().values().sum();

        println!(
            "{:<28} acc {:.3}  loss {:.4}  sum(F) {:.3e}",
            label, last.test_accuracy, last.test_loss, fim_total
        );
    }
    Ok(())
}
