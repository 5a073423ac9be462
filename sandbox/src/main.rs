use anyhow::{bail, Context, Result};
use cartpole_protocol::{Action, Activation, Command, Mode, SandboxEvent, SavedModel};
use cartpole_sandbox::config::Config;
use cartpole_sandbox::rl::agent::{Agent, StepSource};
use cartpole_sandbox::rl::bench::{self, BenchConfig};
use cartpole_sandbox::rl::history::SurvivalHistory;
use cartpole_sandbox::session::{Sandbox, SandboxHandle};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cartpole-sandbox", about = "On-line actor-critic training on the cart-pole task")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Train a single agent headlessly
    Train {
        #[command(flatten)]
        common: CommonArgs,

        /// Training episodes to run
        #[arg(long, default_value = "500")]
        episodes: usize,

        /// Evaluation episodes after training
        #[arg(long, default_value = "10")]
        eval_episodes: usize,

        /// Write recent survival and exploration per episode here as JSON
        #[arg(long)]
        history_out: Option<PathBuf>,
    },
    /// Repeated seeded training runs, in parallel
    Bench {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of seeds, starting at --seed
        #[arg(long, default_value = "8")]
        runs: u64,

        /// Training episodes per run
        #[arg(long, default_value = "200")]
        episodes: usize,

        /// Use the decaying ε schedule instead of freezing it at 0
        #[arg(long, default_value = "false")]
        explore: bool,

        /// Randomize the start state instead of starting upright at rest
        #[arg(long, default_value = "false")]
        random_start: bool,
    },
    /// Drive a live session with commands on stdin
    Interactive {
        #[command(flatten)]
        common: CommonArgs,

        /// Also print every step event
        #[arg(long, default_value = "false")]
        steps: bool,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// JSON config file; flags override its values
    #[arg(long, env = "CARTPOLE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CARTPOLE_SEED")]
    seed: Option<u64>,

    /// Training speed, 1–10
    #[arg(long, env = "CARTPOLE_SPEED")]
    speed: Option<u32>,

    #[arg(long)]
    lr: Option<f64>,

    /// Discount factor
    #[arg(long)]
    gamma: Option<f64>,

    #[arg(long)]
    entropy_coef: Option<f64>,

    #[arg(long)]
    value_coef: Option<f64>,

    #[arg(long)]
    max_grad_norm: Option<f64>,

    #[arg(long)]
    gae_lambda: Option<f64>,

    /// Hidden layer width
    #[arg(long)]
    hidden: Option<usize>,

    /// Number of hidden layers
    #[arg(long)]
    depth: Option<usize>,

    /// relu, tanh, elu or swish
    #[arg(long)]
    activation: Option<Activation>,

    #[arg(long)]
    lr_decay: Option<f64>,

    /// Start from a saved model
    #[arg(long)]
    load: Option<PathBuf>,

    /// Write the final model here as JSON
    #[arg(long, env = "CARTPOLE_SNAPSHOT_OUT")]
    snapshot_out: Option<PathBuf>,
}

impl CommonArgs {
    fn resolve(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let hp = &mut cfg.hyperparameters;
        if let Some(v) = self.lr {
            hp.learning_rate = v;
        }
        if let Some(v) = self.gamma {
            hp.discount = v;
        }
        if let Some(v) = self.entropy_coef {
            hp.entropy_coef = v;
        }
        if let Some(v) = self.value_coef {
            hp.value_coef = v;
        }
        if let Some(v) = self.max_grad_norm {
            hp.max_grad_norm = v;
        }
        if let Some(v) = self.gae_lambda {
            hp.gae_lambda = v;
        }
        if let Some(v) = self.hidden {
            hp.hidden_size = v;
        }
        if let Some(v) = self.depth {
            hp.depth = v;
        }
        if let Some(v) = self.activation {
            hp.activation = v;
        }
        if let Some(v) = self.lr_decay {
            hp.lr_decay = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.speed {
            cfg.speed = v;
        }
        cfg.validate().context("Invalid configuration")?;
        Ok(cfg)
    }

    fn build_agent(&self, cfg: &Config) -> Result<Agent> {
        let mut agent = Agent::new(cfg.hyperparameters.clone(), cfg.seed);
        if let Some(path) = &self.load {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read model {}", path.display()))?;
            let model: SavedModel = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid model file {}", path.display()))?;
            agent.load_model(&model)?;
            tracing::info!(path = %path.display(), episode = model.episode, "Loaded model");
        }
        Ok(agent)
    }

    fn save(&self, agent: &Agent) -> Result<()> {
        match &self.snapshot_out {
            Some(path) => write_model(agent, path),
            None => Ok(()),
        }
    }
}

fn write_model(agent: &Agent, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&agent.saved_model())?;
    std::fs::write(path, json).with_context(|| format!("Failed to write model {}", path.display()))?;
    tracing::info!(path = %path.display(), episode = agent.episode(), "Model saved");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Cmd::Train { common, episodes, eval_episodes, history_out } => {
            train(&common, episodes, eval_episodes, history_out.as_deref())
        }
        Cmd::Bench { common, runs, episodes, explore, random_start } => {
            run_bench(&common, runs, episodes, explore, random_start)
        }
        Cmd::Interactive { common, steps } => interactive(&common, steps).await,
    }
}

fn train(common: &CommonArgs, episodes: usize, eval_episodes: usize, history_out: Option<&Path>) -> Result<()> {
    let cfg = common.resolve()?;
    let mut agent = common.build_agent(&cfg)?;
    tracing::info!(
        arch = %agent.network().arch_string(),
        params = agent.network().n_params(),
        activation = %cfg.hyperparameters.activation,
        seed = cfg.seed,
        "Training"
    );

    let mut best = 0;
    for _ in 0..episodes {
        let summary = agent.run_episode(StepSource::Explore, true);
        best = best.max(summary.steps);
    }

    let eval: Vec<usize> = (0..eval_episodes)
        .map(|_| agent.run_episode(StepSource::Evaluate, false).steps)
        .collect();
    let eval_mean = eval.iter().sum::<usize>() as f64 / eval.len().max(1) as f64;
    tracing::info!(
        episodes,
        best,
        avg_survival = format!("{:.1}", agent.history().mean_recent(10)),
        eval_mean = format!("{eval_mean:.1}"),
        mean_abs_weight = ?agent.network().mean_abs_weight(),
        "Training finished"
    );

    if let Some(path) = history_out {
        write_history(agent.history(), path)?;
    }
    common.save(&agent)
}

/// Oldest first; one `{episode, survival, exploration}` object per retained episode.
fn write_history(history: &SurvivalHistory, path: &Path) -> Result<()> {
    let rows: Vec<_> = history
        .survival()
        .zip(history.exploration())
        .enumerate()
        .map(|(i, (survival, exploration))| {
            serde_json::json!({ "episode": i + 1, "survival": survival, "exploration": exploration })
        })
        .collect();
    let json = serde_json::to_string_pretty(&rows)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write history {}", path.display()))?;
    tracing::info!(path = %path.display(), episodes = rows.len(), "History saved");
    Ok(())
}

fn run_bench(common: &CommonArgs, runs: u64, episodes: usize, explore: bool, random_start: bool) -> Result<()> {
    if runs == 0 {
        bail!("--runs must be at least 1");
    }
    let cfg = common.resolve()?;
    let bench_cfg = BenchConfig {
        hyper: cfg.hyperparameters,
        seeds: (cfg.seed..cfg.seed + runs).collect(),
        episodes,
        exploration: if explore { None } else { Some(0.0) },
        start_state: if random_start { None } else { Some([0.0; 4]) },
    };

    let result = bench::run(&bench_cfg);
    for r in &result.runs {
        println!(
            "Seed {:4} | First {}: {:6.1} | Last {}: {:6.1} | Best: {:4} | {:.1}s",
            r.seed,
            bench::WINDOW,
            r.first_mean(),
            bench::WINDOW,
            r.last_mean(),
            r.best(),
            r.elapsed_secs
        );
    }
    println!(
        "\nMean first {}: {:.1} | Mean last {}: {:.1} | {} | {:.1}s total",
        bench::WINDOW,
        result.mean_first(),
        bench::WINDOW,
        result.mean_last(),
        if result.improved() { "improved" } else { "no improvement" },
        result.elapsed_secs
    );
    Ok(())
}

/// Parse one stdin line: a JSON command or a short word form.
fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.starts_with('{') {
        return serde_json::from_str(line).context("Invalid JSON command");
    }
    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default().to_ascii_lowercase();
    let arg = words.next();
    let command = match head.as_str() {
        "train" => Command::SetMode { mode: Mode::Training },
        "test" => Command::SetMode { mode: Mode::Testing },
        "manual" => Command::SetMode { mode: Mode::Manual },
        "idle" | "stop" => Command::SetMode { mode: Mode::Idle },
        "pause" | "resume" => Command::TogglePause,
        "left" | "right" | "l" | "r" => Command::ManualAction { action: head.parse::<Action>()? },
        "lr" => Command::SetLearningRate {
            lr: arg.context("usage: lr <rate>")?.parse().context("learning rate must be a number")?,
        },
        "speed" => Command::SetSpeed {
            speed: arg.context("usage: speed <1-10>")?.parse().context("speed must be an integer")?,
        },
        "reset" => Command::ResetPolicy,
        "quit" | "exit" => Command::Shutdown,
        other => bail!("unknown command '{other}'"),
    };
    Ok(command)
}

async fn interactive(common: &CommonArgs, show_steps: bool) -> Result<()> {
    let cfg = common.resolve()?;
    let agent = common.build_agent(&cfg)?;
    let (sandbox, handle, mut events) = Sandbox::new(agent, cfg.speed);
    let session = tokio::spawn(sandbox.run());

    let lines = BufReader::new(tokio::io::stdin()).lines();
    let stop = async {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT");
        }
    };
    relay(lines, &handle, &mut events, show_steps, stop).await?;

    // The session may already be gone after a `quit`.
    let _ = handle.send(Command::Shutdown);
    let agent = session.await.context("Sandbox task failed")?;
    common.save(&agent)
}

/// Forward input lines to the session and print its events until input
/// ends, the session closes, or `stop` resolves.
async fn relay<R>(
    mut lines: Lines<R>,
    handle: &SandboxHandle,
    events: &mut UnboundedReceiver<SandboxEvent>,
    show_steps: bool,
    stop: impl Future<Output = ()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    tokio::pin!(stop);
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_command(&line) {
                    Ok(command) => handle.send(command)?,
                    Err(e) => tracing::warn!("{e:#}"),
                },
                None => return Ok(()),
            },
            event = events.recv() => match event {
                Some(SandboxEvent::Step(_)) if !show_steps => {}
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => return Ok(()),
            },
            _ = &mut stop => return Ok(()),
        }
    }
}
