//! `syncd` binary: primary controller, agent runtime, and a handful of
//! operator debug commands built on top of the [`syncd`] library.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use syncd::config::{self, AgentConfig, PrimaryConfig};
use syncd::controller::{Controller, InMemoryProjectConfigSource, Listener, ProjectConfigEntry, ProjectConfigSource, SessionPool};
use syncd::logging::{self, info};
use syncd::registry::{Node, NodeHealth, NodeStatus, Registry};
use syncd::taskstore::TaskStore;
use syncd::tls;
use syncd::SyncdError;

#[derive(Parser)]
#[command(name = "syncd", version, about = "Block-level sync controller and agent")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the primary: task dispatcher plus the mTLS session listener.
	Primary(PrimaryArgs),
	/// Run the agent: reconnect loop plus tree reconstruction.
	Agent(AgentArgs),
	/// Generate (if absent) and print the fingerprint of a self-signed identity.
	Keygen(KeygenArgs),
}

#[derive(Args)]
struct PrimaryArgs {
	/// Config file (TOML or JSON5 by extension).
	#[arg(long)]
	config: Option<PathBuf>,
	/// Overrides `listenAddr` from the config file.
	#[arg(long)]
	listen: Option<String>,
	/// Overrides `stateDir` from the config file.
	#[arg(long)]
	state_dir: Option<PathBuf>,
	#[command(subcommand)]
	debug: Option<PrimaryDebugCommand>,
}

#[derive(Subcommand)]
enum PrimaryDebugCommand {
	/// Enqueue one task per configured node for `project`, without starting the listener.
	Trigger {
		project: String,
		#[arg(long, default_value = "manual")]
		cause: String,
	},
	/// Register a node in the registry and print its generated token.
	AddNode {
		node_id: u64,
		name: String,
		/// Connectivity hint only; never authoritative (spec.md §3 `Node.address`).
		#[arg(long, default_value = "")]
		address: String,
	},
}

#[derive(Args)]
struct AgentArgs {
	#[arg(long)]
	node_id: u64,
	/// Shared secret issued by the primary's node registry.
	#[arg(long)]
	token: String,
	#[arg(long)]
	primary: String,
	#[arg(long)]
	tls_dir: Option<PathBuf>,
	/// Statically pin the primary's fingerprint instead of TOFU-pinning on first connect.
	#[arg(long)]
	pinned_fingerprint: Option<String>,
	#[arg(long)]
	hostname: Option<String>,
}

#[derive(Args)]
struct KeygenArgs {
	#[arg(long)]
	dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	logging::init_tracing();
	let cli = Cli::parse();

	match cli.command {
		Command::Primary(args) => run_primary(args).await?,
		Command::Agent(args) => run_agent(args).await?,
		Command::Keygen(args) => run_keygen(args)?,
	}
	Ok(())
}

async fn run_primary(args: PrimaryArgs) -> Result<(), SyncdError> {
	let mut cfg = config::load_primary_config(args.config.as_deref())?;
	if let Some(listen) = args.listen {
		cfg.listen_addr = listen;
	}
	if let Some(state_dir) = args.state_dir {
		cfg.state_dir = state_dir;
	}

	let registry = Arc::new(Registry::open(&cfg.state_dir.join("registry.redb"))?);
	let task_store = Arc::new(TaskStore::open(&cfg.state_dir.join("tasks.redb"))?);
	let pool = SessionPool::new();
	let config_source = build_config_source(&cfg);
	let controller = Controller::new(registry.clone(), task_store.clone(), pool.clone(), config_source, &cfg);

	if let Some(debug) = args.debug {
		return run_primary_debug(debug, &controller, &registry).await;
	}

	let identity = Arc::new(tls::load_or_generate_identity(&cfg.state_dir.join("tls"))?);
	info!(fingerprint = %identity.fingerprint(), "primary identity ready");

	let worker_pool_size = cfg
		.worker_pool_size
		.unwrap_or_else(|| 4 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
	let cancel = CancellationToken::new();
	controller.spawn_dispatcher(worker_pool_size, cancel.clone());

	let listener = Listener::bind(&cfg.listen_addr, identity, registry, pool).await?;
	info!(listen_addr = %cfg.listen_addr, "listening for agent connections");

	tokio::select! {
		result = listener.serve(cancel.clone()) => result?,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown signal received");
			cancel.cancel();
		}
	}
	Ok(())
}

async fn run_primary_debug(
	debug: PrimaryDebugCommand,
	controller: &Arc<Controller>,
	registry: &Registry,
) -> Result<(), SyncdError> {
	match debug {
		PrimaryDebugCommand::Trigger { project, cause } => {
			let ids = controller.trigger(&project, &cause).await?;
			println!("enqueued {} task(s): {:?}", ids.len(), ids);
		}
		PrimaryDebugCommand::AddNode { node_id, name, address } => {
			let token = uuid::Uuid::new_v4().to_string();
			registry.put(&Node {
				id: node_id,
				name,
				address,
				token: token.clone(),
				agent_cert_fingerprint: None,
				status: NodeStatus::Offline,
				health: NodeHealth::Unknown,
				last_seen: None,
				agent_version: String::new(),
			})?;
			println!("node {} registered, token: {}", node_id, token);
		}
	}
	Ok(())
}

/// Builds the debug/standalone [`ProjectConfigSource`] from the primary
/// config file's `[projects.*]` tables.
fn build_config_source(cfg: &PrimaryConfig) -> Arc<dyn ProjectConfigSource> {
	let source = InMemoryProjectConfigSource::new();
	for (name, project) in &cfg.projects {
		source.insert(
			name.clone(),
			ProjectConfigEntry { project_root: project.project_root.clone(), config: project.sync.clone() },
		);
	}
	Arc::new(source)
}

async fn run_agent(args: AgentArgs) -> Result<(), SyncdError> {
	let tls_dir = args.tls_dir.unwrap_or_else(|| {
		directories::ProjectDirs::from("", "", "syncd-agent")
			.map(|d| d.data_dir().to_path_buf())
			.unwrap_or_else(|| PathBuf::from("/var/lib/syncd-agent/tls"))
	});
	let hostname = args.hostname.unwrap_or_else(detect_hostname);

	let config = AgentConfig {
		node_id: args.node_id,
		token: args.token,
		primary_addr: args.primary,
		pinned_server_fingerprint: args.pinned_fingerprint,
		tls_dir,
		heartbeat_interval: std::time::Duration::from_secs(30),
		hostname,
	};

	let runtime = syncd::agent::AgentRuntime::new(config)?;
	let cancel = runtime.cancellation_token();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("shutdown signal received");
			cancel.cancel();
		}
	});
	runtime.run().await
}

fn detect_hostname() -> String {
	sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

fn run_keygen(args: KeygenArgs) -> Result<(), SyncdError> {
	let identity = tls::load_or_generate_identity(&args.dir).map_err(SyncdError::from)?;
	println!("identity directory: {}", args.dir.display());
	println!("fingerprint: {}", identity.fingerprint());
	Ok(())
}

// vim: ts=4
