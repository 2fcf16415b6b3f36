use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use arbiter::clock::{Clock, SystemClock};
use arbiter::config::StorageBackend;
use arbiter::engine::{Orchestrator, TaskOutcome, TaskRequest};
use arbiter::planner::{LlmPlanner, Planner};
use arbiter::providers::{
    AnthropicProvider, EmbeddingProvider, HashingEmbeddingProvider, HttpSpecialistClient,
    LLMProvider, OpenAIEmbeddingProvider, OpenAIProvider,
};
use arbiter::registry::{AgentRegistry, InMemoryRegistry};
use arbiter::reputation::ReputationEngine;
use arbiter::resilience::{CircuitBreaker, FallbackChain};
use arbiter::routing::{CapabilityRanker, PriceRouter};
use arbiter::storage::{FileStateStore, InMemoryStateStore, PostgresStateStore, StateStore};
use arbiter::types::DagPlan;
use arbiter::Config;

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(about = "Resilient routing and orchestration across specialist agents", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent registry snapshot (.yaml or .json)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file step by step
    Run {
        plan: PathBuf,
        #[arg(long)]
        max_budget: Option<f64>,
    },
    /// Check a plan's estimated cost against a budget
    Budget {
        plan: PathBuf,
        #[arg(long)]
        max: f64,
    },
    /// Rank agents for a task and run it with fallback
    Route {
        task: String,
        #[arg(long)]
        exclude: Vec<String>,
        /// Have the LLM planner split the task into steps
        #[arg(long)]
        multi_step: bool,
        /// Only print the fallback chain
        #[arg(long)]
        dry_run: bool,
    },
    /// Show circuit and reputation state per agent
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let services = Services::build(&config, cli.registry.as_deref()).await?;

    match cli.command {
        Commands::Run { plan, max_budget } => run_plan(&services, &plan, max_budget).await?,
        Commands::Budget { plan, max } => check_budget(&services, &plan, max)?,
        Commands::Route {
            task,
            exclude,
            multi_step,
            dry_run,
        } => {
            services.warm_ranker().await?;
            route_task(&services, &task, exclude, multi_step, dry_run).await?
        }
        Commands::Status => show_status(&services).await?,
    }

    Ok(())
}

struct Services {
    registry: Arc<dyn AgentRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    ranker: Arc<CapabilityRanker>,
    prices: Arc<PriceRouter>,
    fallback: Arc<FallbackChain>,
    orchestrator: Orchestrator,
}

impl Services {
    async fn build(config: &Config, registry_path: Option<&Path>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = open_store(config).await?;

        let registry: Arc<dyn AgentRegistry> = match registry_path {
            Some(path) => Arc::new(InMemoryRegistry::from_file(path)?),
            None => Arc::new(InMemoryRegistry::new()),
        };

        let embedder: Arc<dyn EmbeddingProvider> = match &config.providers.openai_api_key {
            Some(key) => Arc::new(OpenAIEmbeddingProvider::new(key.clone())),
            None => {
                log::warn!("OPENAI_API_KEY not set; using local hashing embeddings");
                Arc::new(HashingEmbeddingProvider::default())
            }
        };

        let breaker = Arc::new(
            CircuitBreaker::load(config.circuit_breaker, store.clone(), clock.clone()).await?,
        );
        let reputation = Arc::new(
            ReputationEngine::load(config.reputation, store.clone(), clock.clone()).await?,
        );
        let prices = Arc::new(
            PriceRouter::load(config.pricing.clone(), registry.clone(), store, clock.clone()).await?,
        );
        let ranker = Arc::new(CapabilityRanker::new(
            config.ranking,
            reputation.clone(),
            prices.clone(),
            clock,
        ));

        let fallback = Arc::new(FallbackChain::new(
            ranker.clone(),
            breaker.clone(),
            registry.clone(),
            embedder.clone(),
        ));
        let client = Arc::new(HttpSpecialistClient::new(
            registry.clone(),
            Duration::from_millis(config.execution.step_timeout_ms),
        )?);

        let mut orchestrator = Orchestrator::new(
            breaker,
            reputation,
            prices.clone(),
            fallback.clone(),
            client.clone(),
            client,
            config.execution,
        );
        if let Some(llm) = llm_provider(config) {
            let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(llm, registry.clone()));
            orchestrator = orchestrator.with_planner(planner);
        }

        Ok(Self {
            registry,
            embedder,
            ranker,
            prices,
            fallback,
            orchestrator,
        })
    }

    /// Embed registry capabilities so the ranker can serve routing requests.
    /// Ctrl-C cancels the backfill.
    async fn warm_ranker(&self) -> Result<()> {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cancel_tx.send(true);
            }
        });
        let agents = self.registry.list_agents().await?;
        self.ranker
            .warm(&agents, self.embedder.as_ref(), &mut cancel_rx)
            .await?;
        Ok(())
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryStateStore::new()),
        StorageBackend::File => Arc::new(FileStateStore::new(&config.storage.path).await?),
        StorageBackend::Postgres => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow!("storage.database_url is required for the postgres backend"))?;
            let store = PostgresStateStore::new(url).await?;
            store.run_migrations().await?;
            Arc::new(store)
        }
    };
    Ok(store)
}

fn llm_provider(config: &Config) -> Option<Arc<dyn LLMProvider>> {
    if let Some(key) = &config.providers.anthropic_api_key {
        return Some(Arc::new(AnthropicProvider::new(key.clone())));
    }
    if let Some(key) = &config.providers.openai_api_key {
        return Some(Arc::new(OpenAIProvider::new(key.clone())));
    }
    None
}

fn read_plan(path: &Path) -> Result<DagPlan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan file {}", path.display()))?;
    let plan: DagPlan = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        _ => serde_yaml::from_str(&raw)?,
    };
    Ok(DagPlan::new(plan.steps))
}

fn check_budget(services: &Services, path: &Path, max: f64) -> Result<()> {
    let plan = read_plan(path)?;
    let result = services.prices.check_budget(&plan, max);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.within_budget {
        println!("Over budget by {:.4}", result.overrun());
    }
    Ok(())
}

async fn run_plan(services: &Services, path: &Path, max_budget: Option<f64>) -> Result<()> {
    let plan = read_plan(path)?;
    let mut request = TaskRequest::new(format!("plan {}", path.display())).with_plan(plan);
    if let Some(max) = max_budget {
        request = request.with_budget(max);
    }
    let outcome = services.orchestrator.execute_task(request).await?;
    print_outcome(&outcome)
}

async fn route_task(
    services: &Services,
    task: &str,
    exclude: Vec<String>,
    multi_step: bool,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        let chain = services.fallback.build_fallback_chain(task, &exclude).await?;
        println!("{}", serde_json::to_string_pretty(&chain)?);
        return Ok(());
    }

    let mut request = TaskRequest::new(task).excluding(exclude);
    if multi_step {
        request = request.multi_step();
    }
    let outcome = services.orchestrator.execute_task(request).await?;
    print_outcome(&outcome)
}

fn print_outcome(outcome: &TaskOutcome) -> Result<()> {
    match outcome {
        TaskOutcome::SingleStep(fallback) => {
            for attempt in &fallback.attempts {
                let status = if attempt.success { "ok" } else { "failed" };
                println!(
                    "  {} {} ({}ms){}",
                    status,
                    attempt.agent_id,
                    attempt.duration_ms,
                    attempt.error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default()
                );
            }
            match &fallback.result {
                Ok(success) => {
                    println!("Answered by {}", success.agent_id);
                    println!("{}", serde_json::to_string_pretty(&success.output)?);
                }
                Err(e) => println!("Task failed: {}", e),
            }
        }
        TaskOutcome::MultiStep(result) => {
            println!("{}", serde_json::to_string_pretty(result)?);
            if result.is_partial_failure() {
                println!("Partial failure: some steps failed or were skipped");
            }
        }
        TaskOutcome::OverBudget(budget) => {
            println!("Plan not started: estimate {:.4} exceeds budget {:.4}", budget.total_cost, budget.max_budget);
        }
    }
    Ok(())
}

async fn show_status(services: &Services) -> Result<()> {
    let breaker = services.orchestrator.circuit_breaker();
    let reputation = services.orchestrator.reputation();

    for agent in services.registry.list_agents().await? {
        let status = breaker.get_status(&agent.id).await;
        let score = reputation.get_reputation_score(&agent.id, None).await;
        println!(
            "{:<24} {:<10} failures={} reputation={:.3} healthy={}",
            agent.id,
            status.state.as_str(),
            status.consecutive_failures,
            score,
            agent.healthy
        );
    }
    Ok(())
}
