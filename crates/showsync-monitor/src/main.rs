use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use showsync_core::{ChannelStatus, OwnerId, Record, ResourceKind};
use showsync_realtime::sim::{ChannelOutcome, SimDataService};
use showsync_realtime::view::ConnectionStatusView;
use showsync_realtime::ws::WsDataService;
use showsync_realtime::{DataService, SyncConfig, SyncCoordinator, SyncEvent, SyncSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "showsync-monitor")]
struct Args {
    /// Owner id whose tour requests and messages are followed.
    #[arg(long, env = "SHOWSYNC_OWNER_ID")]
    owner: String,
    /// Backend WebSocket endpoint, e.g. ws://127.0.0.1:4100/sync.
    #[arg(long, env = "SHOWSYNC_URL", default_value = "")]
    url: String,
    /// Run against the in-memory simulator instead of a backend.
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Simulator only: fail this many channel subscribe attempts first.
    #[arg(long, default_value_t = 0)]
    simulate_channel_failures: usize,
    /// Simulator only: seconds between synthetic tour-request changes.
    #[arg(long, default_value_t = 15)]
    simulate_change_every: u64,
    #[arg(long, env = "SHOWSYNC_CONFIG", default_value = "showsync.toml")]
    config: PathBuf,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    disabled: bool,
    /// Print readiness as JSON instead of the status view.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug || env_true("SHOWSYNC_DEBUG"));
    if let Err(err) = run(args).await {
        error!(event = "monitor_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let owner_id = OwnerId::new(args.owner.clone())
        .ok_or_else(|| anyhow!("owner id must not be blank"))?;
    let service = build_service(&args, &owner_id)?;

    info!(
        event = "monitor_start",
        owner_id = %owner_id,
        simulate = args.simulate,
        enabled = config.enabled,
        poll_interval_ms = config.polling.base_interval_ms
    );

    let (mut coordinator, mut events) = SyncCoordinator::new(config, service);
    coordinator.set_owner(Some(owner_id)).await;

    let Some(mut snapshots) = coordinator.watch() else {
        render(&coordinator.snapshot(), args.json);
        info!(event = "monitor_idle", reason = "sync disabled");
        return Ok(());
    };
    render(&snapshots.borrow_and_update().clone(), args.json);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                render(&snapshot, args.json);
            }
            Some(event) = events.recv() => log_event(&event),
        }
    }

    info!(event = "monitor_stop");
    coordinator.shutdown().await;
    Ok(())
}

fn build_service(args: &Args, owner_id: &OwnerId) -> Result<Arc<dyn DataService>> {
    if args.simulate {
        let sim = seed_simulator(owner_id, args);
        spawn_change_driver(
            sim.clone(),
            owner_id.clone(),
            Duration::from_secs(args.simulate_change_every.max(1)),
        );
        return Ok(Arc::new(sim));
    }
    let url = url::Url::parse(args.url.trim())
        .with_context(|| format!("invalid backend url '{}'; pass --url or --simulate", args.url))?;
    Ok(Arc::new(WsDataService::new(url)))
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = SyncConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Ok(value) = std::env::var("SHOWSYNC_ENABLED") {
        config.enabled = is_truthy(&value);
    }
    if let Some(ms) = env_u64("SHOWSYNC_POLL_INTERVAL_MS") {
        config.polling.base_interval_ms = ms;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.polling.base_interval_ms = ms;
    }
    if args.disabled {
        config.enabled = false;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn seed_simulator(owner_id: &OwnerId, args: &Args) -> SimDataService {
    let sim = SimDataService::new();
    sim.set_records(
        owner_id,
        ResourceKind::TourRequests,
        vec![Record::new("tr-1").with_field("status", "pending".into())],
    );
    sim.set_records(
        owner_id,
        ResourceKind::Messages,
        vec![Record::new("m-1"), Record::new("m-2")],
    );
    sim.set_records(owner_id, ResourceKind::UnreadMessages, vec![Record::new("m-2")]);
    if args.simulate_channel_failures > 0 {
        sim.script_channel(
            ResourceKind::TourRequests,
            std::iter::repeat(ChannelOutcome::Status(ChannelStatus::Error))
                .take(args.simulate_channel_failures),
        );
    }
    sim
}

/// Appends a tour request periodically, as another user booking a showing
/// would.
fn spawn_change_driver(sim: SimDataService, owner_id: OwnerId, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        let mut next_id = 2;
        let mut records = vec![Record::new("tr-1").with_field("status", "pending".into())];
        loop {
            ticker.tick().await;
            records.push(
                Record::new(format!("tr-{next_id}"))
                    .with_field("requested_at", Utc::now().to_rfc3339().into()),
            );
            next_id += 1;
            sim.set_records(&owner_id, ResourceKind::TourRequests, records.clone());
            let notified = sim.notify_change(&owner_id, ResourceKind::TourRequests);
            info!(event = "sim_change", records = records.len(), notified);
        }
    });
}

fn render(snapshot: &SyncSnapshot, json: bool) {
    if json {
        match serde_json::to_string(&snapshot.readiness) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(event = "render_error", error = %err),
        }
        return;
    }
    print!("{}", ConnectionStatusView::from_snapshot(snapshot));
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Records {
            owner_id,
            kind,
            records,
        } => info!(event = "records", owner_id = %owner_id, kind = %kind, count = records.len()),
        SyncEvent::Warning {
            owner_id,
            subscription,
            message,
        } => warn!(
            event = "sync_warning",
            owner_id = %owner_id,
            subscription = subscription.as_str(),
            message = %message
        ),
        SyncEvent::UnreadCount { owner_id, count } => info!(
            event = "unread_count",
            owner_id = %owner_id,
            count = count.count.unwrap_or(0),
            stale = count.stale
        ),
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SHOWSYNC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging_init_error: subscriber already set");
    }
}

fn env_true(key: &str) -> bool {
    std::env::var(key).map(|value| is_truthy(&value)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
