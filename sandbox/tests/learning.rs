use cartpole_protocol::Hyperparameters;
use cartpole_sandbox::rl::bench::{self, BenchConfig, WINDOW};

fn assert_block_improves(seeds: Vec<u64>) {
    let cfg = BenchConfig {
        hyper: Hyperparameters::default(),
        seeds: seeds.clone(),
        episodes: 200,
        exploration: Some(0.0),
        start_state: Some([0.0; 4]),
    };
    let result = bench::run(&cfg);

    for r in &result.runs {
        assert_eq!(r.survival.len(), 200);
        assert!(r.survival.iter().all(|&s| (1..=500).contains(&s)));
    }
    assert!(
        result.improved(),
        "seeds {seeds:?}: mean of first {WINDOW}: {:.1}, last {WINDOW}: {:.1}",
        result.mean_first(),
        result.mean_last()
    );
}

/// Upright start, exploration frozen at 0, default hyperparameters:
/// survival over the last episodes beats the first ones on average.
#[test]
fn survival_improves_over_200_episodes() {
    assert_block_improves((0..6).collect());
}

#[test]
fn survival_improves_for_distant_seed_block() {
    assert_block_improves((7777..7783).collect());
}

#[test]
fn deeper_networks_train_without_blowing_up() {
    use cartpole_protocol::Activation;
    use cartpole_sandbox::rl::agent::{Agent, StepSource};

    for activation in [Activation::Tanh, Activation::Elu, Activation::Swish] {
        let hp = Hyperparameters { depth: 3, hidden_size: 16, activation, ..Default::default() };
        let mut agent = Agent::new(hp, 11);
        for _ in 0..20 {
            let s = agent.run_episode(StepSource::Explore, true);
            let d = s.diagnostics.expect("training episode produces diagnostics");
            assert!(d.grad_norm.is_finite(), "{activation}: grad norm {}", d.grad_norm);
            assert!(d.mean_critic_loss.is_finite());
        }
        let s = [0.1, 0.2, -0.1, 0.3];
        let out = agent.network().evaluate(&s);
        assert!(out.value.is_finite());
        assert!((out.policy.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
