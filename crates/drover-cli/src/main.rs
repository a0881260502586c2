use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use drover_core::{
    ActionExecutor, Checkpoint, ColdStart, ElementHandle, EngineConfig, EngineEvent,
    EngineEventKind, EngineResult, EventSink, Progress, RestartHost, RunOutcome, RunState,
    Selector, SharedActionExecutor, SharedRestartHost, Statistics, WaitOutcome, WorkEngine,
    engine_event_channel, keys, load,
};
use drover_store::{FsStateStore, MemoryStateStore, SharedStateStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Resilient work orchestrator over a simulated target")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Resume(ResumeArgs),
    Inspect(InspectArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory holding the durable state file; omitted = in-memory.
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    total: u32,
    #[arg(long, default_value_t = 500.0)]
    amount_limit: f64,
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    /// Items (by index) that never cooperate; exhaust the retry
    /// budget and end up skipped.
    #[arg(long = "fail-item")]
    fail_items: Vec<u32>,
    /// Items that fail exactly once before cooperating.
    #[arg(long = "flaky-item")]
    flaky_items: Vec<u32>,
    /// Items whose amount lands over the limit.
    #[arg(long = "over-limit-item")]
    over_limit_items: Vec<u32>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    state_dir: PathBuf,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    #[arg(long)]
    state_dir: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Resume(args) => resume_command(args).await,
        Commands::Inspect(args) => inspect_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let store = open_store(args.state_dir.clone())?;

    let target = SimulatedTarget::new(
        Arc::clone(&store),
        args.total,
        args.seed,
        args.amount_limit,
        &args.over_limit_items,
        &args.fail_items,
        &args.flaky_items,
    );
    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);

    let engine = WorkEngine::new(
        Arc::clone(&store),
        Arc::clone(&target) as SharedActionExecutor,
        Arc::clone(&target) as SharedRestartHost,
        event_sink,
    );
    let config = EngineConfig {
        total_items: args.total,
        amount_limit: args.amount_limit,
        max_retries: args.max_retries,
        // The simulated target answers instantly; long pacing delays
        // only slow the demonstration down.
        step_wait_ms: 50,
        inter_item_delay_ms: 5,
        settle_delay_ms: 5,
        retry_timeout_ms: 100,
        extended_timeout_ms: 200,
        ..EngineConfig::default()
    };

    engine
        .start(args.total, config)
        .await
        .map_err(|error| error.to_string())?;
    let outcome = drive_to_settled(&engine).await?;

    // Tear the engine down so its event sender closes and the
    // printer task below can finish.
    if outcome != RunOutcome::Completed {
        engine.stop().await.map_err(|error| error.to_string())?;
    }
    drop(engine);
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }
    print_summary(&store, outcome).await?;
    Ok(exit_code_for_outcome(outcome))
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, String> {
    let store = open_store(Some(args.state_dir))?;

    let config: EngineConfig = load(&store, keys::CONFIG)
        .await
        .map_err(|error| error.to_string())?
        .unwrap_or_default();
    let target = SimulatedTarget::new(
        Arc::clone(&store),
        config.total_items,
        args.seed,
        config.amount_limit,
        &[],
        &[],
        &[],
    );
    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);

    let engine = WorkEngine::new(
        Arc::clone(&store),
        Arc::clone(&target) as SharedActionExecutor,
        Arc::clone(&target) as SharedRestartHost,
        event_sink,
    );

    let cold_start = engine
        .initialize()
        .await
        .map_err(|error| error.to_string())?;
    let outcome = match cold_start {
        ColdStart::ResumeProcessing => drive_to_settled(&engine).await?,
        ColdStart::AwaitResume => {
            engine.resume().await.map_err(|error| error.to_string())?;
            drive_to_settled(&engine).await?
        }
        ColdStart::Idle => {
            println!("nothing to resume");
            RunOutcome::Stopped
        }
    };

    if outcome != RunOutcome::Completed {
        engine.stop().await.map_err(|error| error.to_string())?;
    }
    drop(engine);
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }
    print_summary(&store, outcome).await?;
    Ok(exit_code_for_outcome(outcome))
}

async fn inspect_command(args: InspectArgs) -> Result<ExitCode, String> {
    let store = open_store(Some(args.state_dir))?;

    let state: Option<RunState> = load(&store, keys::RUN_STATE)
        .await
        .map_err(|error| error.to_string())?;
    let progress: Option<Progress> = load(&store, keys::PROGRESS)
        .await
        .map_err(|error| error.to_string())?;
    let checkpoint = Checkpoint::load(&store)
        .await
        .map_err(|error| error.to_string())?;
    let statistics: Option<Statistics> = load(&store, keys::STATISTICS)
        .await
        .map_err(|error| error.to_string())?;

    if args.json {
        let view = serde_json::json!({
            "runState": state,
            "progress": progress,
            "checkpoint": checkpoint,
            "statistics": statistics,
        });
        let json = serde_json::to_string_pretty(&view).map_err(|error| error.to_string())?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "run_state: {}",
        state.map(RunState::as_str).unwrap_or("<none>")
    );
    match progress {
        Some(progress) => println!("progress: {}/{}", progress.current, progress.total),
        None => println!("progress: <none>"),
    }
    match checkpoint {
        Some(checkpoint) => println!(
            "checkpoint: {:?} at iteration {} (retries {})",
            checkpoint.action, checkpoint.iteration, checkpoint.retry_count
        ),
        None => println!("checkpoint: <none>"),
    }
    match statistics {
        Some(stats) => {
            println!("run_id: {}", stats.run_id);
            println!(
                "processed: {} (ok {}, skipped {}, failed {}, retries {})",
                stats.total_processed,
                stats.successful,
                stats.skipped,
                stats.failed,
                stats.retry_attempts
            );
            println!(
                "avg_processing_time_ms: {:.1}",
                stats.average_processing_time_ms
            );
        }
        None => println!("statistics: <none>"),
    }
    Ok(ExitCode::SUCCESS)
}

fn open_store(state_dir: Option<PathBuf>) -> Result<SharedStateStore, String> {
    match state_dir {
        Some(dir) => {
            let store = FsStateStore::new(&dir)
                .map_err(|error| format!("failed opening state dir '{}': {error}", dir.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStateStore::new())),
    }
}

/// Re-enter the engine after each forced restart until the run
/// settles, standing in for a host that re-initializes on restart.
async fn drive_to_settled(engine: &Arc<WorkEngine>) -> Result<RunOutcome, String> {
    let mut outcome = engine
        .continue_processing()
        .await
        .map_err(|error| error.to_string())?;
    while outcome == RunOutcome::RestartPending {
        let resumed = engine
            .resume_from_checkpoint()
            .await
            .map_err(|error| error.to_string())?;
        if !resumed {
            break;
        }
        outcome = engine
            .continue_processing()
            .await
            .map_err(|error| error.to_string())?;
    }
    Ok(outcome)
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (EventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (EventSink::default(), None);
    }

    let (tx, mut rx) = engine_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (EventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &EngineEvent) {
    let label = match &event.kind {
        EngineEventKind::StateChanged { state } => format!("state -> {}", state.as_str()),
        EngineEventKind::ProgressUpdate { progress, .. } => {
            format!("progress {}/{}", progress.current, progress.total)
        }
        EngineEventKind::StatisticsUpdate { summary } => format!(
            "stats ok={} skipped={} failed={} retries={}",
            summary.successful, summary.skipped, summary.failed, summary.retry_attempts
        ),
        EngineEventKind::ProcessingComplete { summary } => format!(
            "complete: {} processed in {}ms",
            summary.total_processed, summary.running_time_ms
        ),
        EngineEventKind::RunFailed { reason, .. } => format!("run failed: {reason}"),
    };
    println!("[event seq={}] {} {label}", event.sequence_no, event.timestamp);
}

async fn print_summary(store: &SharedStateStore, outcome: RunOutcome) -> Result<(), String> {
    let statistics: Option<Statistics> = load(store, keys::STATISTICS)
        .await
        .map_err(|error| error.to_string())?;
    println!(
        "outcome: {}",
        match outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::Paused => "paused",
            RunOutcome::Stopped => "stopped",
            RunOutcome::RestartPending => "restart_pending",
        }
    );
    if let Some(stats) = statistics {
        println!(
            "processed {} of which ok={} skipped={} failed={} (retries {}, success rate {:.1}%)",
            stats.total_processed,
            stats.successful,
            stats.skipped,
            stats.failed,
            stats.retry_attempts,
            stats.success_rate()
        );
    }
    Ok(())
}

fn exit_code_for_outcome(outcome: RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Completed => ExitCode::SUCCESS,
        _ => ExitCode::from(2),
    }
}

/// In-process stand-in for the external target. Which item it
/// presents is derived from the persisted progress, the same view a
/// real target would give a host that just restarted.
struct SimulatedTarget {
    store: SharedStateStore,
    amounts: Vec<f64>,
    /// Remaining confirm-waits that time out, per item; `u32::MAX`
    /// marks an item that never cooperates.
    failing_waits: Vec<AtomicU32>,
    restarts: AtomicU32,
}

impl SimulatedTarget {
    #[allow(clippy::too_many_arguments)]
    fn new(
        store: SharedStateStore,
        total: u32,
        seed: u64,
        amount_limit: f64,
        over_limit_items: &[u32],
        fail_items: &[u32],
        flaky_items: &[u32],
    ) -> Arc<Self> {
        let amounts = (0..total)
            .map(|index| {
                if over_limit_items.contains(&index) {
                    amount_limit + 50.0
                } else {
                    let unit = draw_unit(seed, u64::from(index));
                    ((5.0 + unit * 120.0) * 100.0).round() / 100.0
                }
            })
            .collect();
        let failing_waits = (0..total)
            .map(|index| {
                if fail_items.contains(&index) {
                    AtomicU32::new(u32::MAX)
                } else if flaky_items.contains(&index) {
                    AtomicU32::new(1)
                } else {
                    AtomicU32::new(0)
                }
            })
            .collect();
        Arc::new(Self {
            store,
            amounts,
            failing_waits,
            restarts: AtomicU32::new(0),
        })
    }

    async fn current_index(&self) -> usize {
        load::<Progress>(&self.store, keys::PROGRESS)
            .await
            .ok()
            .flatten()
            .map(|progress| progress.current as usize)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ActionExecutor for SimulatedTarget {
    async fn locate(&self, selector: Selector) -> Option<ElementHandle> {
        match selector {
            Selector::AmountField => {
                let index = self.current_index().await;
                let amount = self.amounts.get(index).copied().unwrap_or(0.0);
                Some(ElementHandle::with_text(
                    selector,
                    format!("${amount:.2} due"),
                ))
            }
            Selector::DetailTag => {
                let index = self.current_index().await;
                Some(ElementHandle::with_text(selector, format!("order-{index}")))
            }
            Selector::RemainderField => {
                Some(ElementHandle::with_text(selector, "$0.00 remaining"))
            }
            Selector::FailureBanner => None,
            _ => Some(ElementHandle::new(selector)),
        }
    }

    async fn invoke(&self, _handle: &ElementHandle) -> bool {
        true
    }

    async fn wait_for(&self, selector: Selector, exists: bool, _timeout_ms: u64) -> WaitOutcome {
        if selector == Selector::ConfirmButton {
            let index = self.current_index().await;
            if let Some(failing) = self.failing_waits.get(index) {
                let remaining = failing.load(Ordering::SeqCst);
                if remaining > 0 {
                    if remaining != u32::MAX {
                        failing.store(remaining - 1, Ordering::SeqCst);
                    }
                    return WaitOutcome::TimedOut;
                }
            }
        }
        if exists {
            WaitOutcome::Found(ElementHandle::new(selector))
        } else {
            WaitOutcome::TimedOut
        }
    }
}

#[async_trait]
impl RestartHost for SimulatedTarget {
    async fn force_restart(&self, target: &str) -> EngineResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        println!("[restart] re-initializing toward '{target}'");
        Ok(())
    }
}

/// Deterministic per-lane unit draw, xorshift over the seed.
fn draw_unit(seed: u64, lane: u64) -> f64 {
    let mut x = seed ^ (lane << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    (r as f64) / (u64::MAX as f64)
}
