//! Quickstart: a small federated run with FIM-regularised clients

use fedfim::checkpoint::MemoryCheckpointSink;
use fedfim::config::DataConfig;
use fedfim::{ExperimentConfig, Orchestrator, RoundLog};

fn main() -> Result<(), fedfim::FedError> {
    println!("fedfim Quickstart Demo\n");

    let config = ExperimentConfig {
        rounds: 5,
        num_clients: 4,
        batch_size: 16,
        local_epochs: 2,
        learning_rate: 0.05,
        fim_lambda: 0.5,
        fim_decay: 0.7,
        hidden_sizes: vec![32],
        data: DataConfig {
            num_classes: 4,
            num_features: 8,
            samples_per_class: 128,
            test_samples_per_class: 32,
            ..Default::default()
        },
        ..Default::default()
    };

    println!(
        "Training {} clients for {} rounds (lambda = {}, gamma = {})...\n",
        config.num_clients, config.rounds, config.fim_lambda, config.fim_decay
    );

    let mut orchestrator = Orchestrator::from_config(config)?;
    let mut log = RoundLog::new();
    let mut checkpoints = MemoryCheckpointSink::default();
    orchestrator.run(&mut log, &mut checkpoints)?;

    for m in log.entries() {
        println!(
            "round {:>2}  loss {:.4}  acc {:.3}  |dθ| {:.4}",
            m.round, m.test_loss, m.test_accuracy, m.update_norm
        );
    }

    println!("\nGlobal FIM after the last round:");
    for (name, value) in orchestrator.global_fim().values() {
        println!("   {:<18} {:.3e}", name, value);
    }
    if let Some(ckpt) = &checkpoints.last {
        println!(
            "\nFinal checkpoint: {} tensors after {} rounds",
            ckpt.params.len(),
            ckpt.rounds_completed
        );
    }
    Ok(())
}
