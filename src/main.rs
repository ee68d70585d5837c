//! appwall - application firewall decision engine
//!
//! Command-line management surface for profiles, rules, the decision log and
//! traffic statistics, plus a simulator that feeds connection events through
//! the decision pipeline.
//!
//! # Usage
//!
//! ```bash
//! appwall profiles list                          # List profiles (* = active)
//! appwall profiles create work -d "Office"       # Create a profile
//! appwall profiles activate work                 # Switch the active profile
//! appwall rules add work block-telnet --action block --protocol tcp --ports 23
//! appwall simulate events.jsonl                  # Decide JSON-lines events
//! appwall logs --app /usr/bin/telnet             # Query the decision log
//! appwall stats --top 5                          # Busiest applications
//! ```

use appwall::config;
use appwall::core::engine::Engine;
use appwall::core::filter::Filter;
use appwall::core::firewall::{Action, ConnectionEvent, Direction, Protocol};
use appwall::core::persist::write_atomic;
use appwall::core::pipeline::Notification;
use appwall::core::profiles::ProfileExport;
use appwall::utils::{self, truncate_string};
use appwall::validators;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "appwall")]
#[command(about = "Application firewall - rules, profiles and connection decisions", long_about = None)]
struct Cli {
    /// Write tracing output to $XDG_STATE_HOME/appwall/appwall.log
    #[arg(long, global = true)]
    log_file: bool,

    /// Data directory (default: $XDG_DATA_HOME/appwall)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    /// Manage rules
    Rules {
        #[command(subcommand)]
        action: RuleCommand,
    },
    /// Query the decision log
    Logs {
        #[command(flatten)]
        filter: FilterArgs,
        /// Show only the most recent N entries
        #[arg(short = 'n', long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Show traffic statistics
    Stats {
        #[command(flatten)]
        filter: FilterArgs,
        /// Show the N applications with the most traffic instead of buckets
        #[arg(long, value_name = "N")]
        top: Option<usize>,
    },
    /// Decide JSON-lines connection events from FILE (or stdin)
    Simulate {
        file: Option<PathBuf>,
    },
    /// Show version and build information
    Version,
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// List all profiles
    List,
    /// Create an empty profile
    Create {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Delete an inactive profile
    Delete { name: String },
    /// Make a profile the active one
    Activate { name: String },
    /// Export a profile and its rules as JSON
    Export {
        name: String,
        /// Write to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Import a profile exported with `profiles export`
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum RuleCommand {
    /// List rules of a profile (default: active) or the whole library
    List {
        profile: Option<String>,
        /// List every rule in the library
        #[arg(long, conflicts_with = "profile")]
        all: bool,
    },
    /// Add a rule to the end of a profile
    Add {
        profile: String,
        name: String,
        /// Application path, glob (/usr/bin/*) or * for any
        #[arg(long, default_value = "*")]
        app: String,
        /// allow or block
        #[arg(long)]
        action: String,
        /// tcp, udp, icmp or any
        #[arg(long, default_value = "any")]
        protocol: String,
        /// Comma-separated ports and ranges (22,8000-9000); empty for any
        #[arg(long, default_value = "")]
        ports: String,
        /// inbound, outbound or any
        #[arg(long, default_value = "any")]
        direction: String,
    },
    /// Remove a rule from a profile (the rule stays in the library)
    Remove { profile: String, name: String },
    /// Delete a rule from the library and every profile
    Delete { name: String },
    /// Turn a logged decision into a permanent rule
    Learn {
        profile: String,
        /// Id of the decision in the log
        id: u64,
        /// Override the logged decision
        #[arg(long)]
        action: Option<String>,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Exact application path
    #[arg(long)]
    app: Option<String>,
    #[arg(long)]
    protocol: Option<String>,
    #[arg(long)]
    direction: Option<String>,
    #[arg(long)]
    action: Option<String>,
    /// RFC 3339 timestamp (inclusive)
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// RFC 3339 timestamp (inclusive)
    #[arg(long)]
    until: Option<DateTime<Utc>>,
}

impl FilterArgs {
    fn into_filter(self) -> appwall::Result<Filter> {
        let mut filter = Filter {
            application: self.app,
            since: self.since,
            until: self.until,
            ..Filter::default()
        };
        if let Some(p) = self.protocol {
            filter.protocol = Some(
                validators::parse_token::<Protocol>("protocol", &p)
                    .map_err(|m| appwall::Error::validation("protocol", m))?,
            );
        }
        if let Some(d) = self.direction {
            filter.direction = Some(
                validators::parse_token::<Direction>("direction", &d)
                    .map_err(|m| appwall::Error::validation("direction", m))?,
            );
        }
        if let Some(a) = self.action {
            filter.action = Some(parse_action(&a)?);
        }
        Ok(filter)
    }
}

fn parse_action(token: &str) -> appwall::Result<Action> {
    validators::parse_token::<Action>("action", token)
        .map_err(|m| appwall::Error::validation("action", m))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.data_dir, cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_file: bool) {
    use tracing_subscriber::EnvFilter;

    if log_file && let Some(dir) = utils::get_state_dir() {
        let opened = utils::ensure_dir(&dir)
            .and_then(|()| std::fs::File::create(dir.join("appwall.log")));
        if let Ok(file) = opened {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
            return;
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(e: &(dyn std::error::Error + 'static)) {
    if let Some(err) = e.downcast_ref::<appwall::Error>() {
        let translation = err.translate();
        eprintln!("Error: {}", translation.user_message);
        for hint in translation.suggestions {
            eprintln!("  hint: {hint}");
        }
    } else {
        eprintln!("Error: {e}");
    }
}

async fn open_engine(data_dir: Option<PathBuf>) -> Result<Engine, Box<dyn std::error::Error>> {
    let dir = data_dir
        .or_else(utils::get_data_dir)
        .ok_or("No data directory available; pass --data-dir")?;
    utils::ensure_dir(&dir)?;
    let config = config::load_config(&dir).await;
    if !dir.join(config::CONFIG_FILE).exists() {
        config::save_config(&dir, &config).await?;
    }
    let engine = Engine::open(config, &dir).await?;
    engine.profiles.ensure_default().await?;
    Ok(engine)
}

async fn handle_cli(
    data_dir: Option<PathBuf>,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Commands::Version = command {
        print_version();
        return Ok(());
    }

    let engine = open_engine(data_dir).await?;
    let result = run_command(&engine, command).await;
    engine.shutdown().await?;
    result
}

async fn run_command(engine: &Engine, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Profiles { action } => handle_profiles(engine, action).await?,
        Commands::Rules { action } => handle_rules(engine, action).await?,
        Commands::Logs { filter, limit } => {
            let entries: Vec<_> = engine.log.query(filter.into_filter()?).collect();
            let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
            println!(
                "{:>6}  {:<20}  {:<32}  {:<5}  {:<8}  {:>5}  {:<6}  RULE",
                "ID", "TIME", "APPLICATION", "PROTO", "DIR", "PORT", "ACTION"
            );
            for entry in entries.iter().skip(skip) {
                println!(
                    "{:>6}  {:<20}  {:<32}  {:<5}  {:<8}  {:>5}  {:<6}  {}",
                    entry.id,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    truncate_string(&entry.event.app_path, 32),
                    entry.event.protocol.as_str(),
                    entry.event.direction.as_str(),
                    entry.event.relevant_port(),
                    entry.decision.as_str(),
                    if entry.used_default_policy() {
                        "(default policy)"
                    } else {
                        entry.rule_name.as_str()
                    }
                );
            }
        }
        Commands::Stats { filter, top } => {
            if let Some(n) = top {
                println!("{:<40}  {:>12}  {:>12}  {:>12}", "APPLICATION", "SENT", "RECEIVED", "TOTAL");
                for usage in engine.stats.top_applications(n) {
                    println!(
                        "{:<40}  {:>12}  {:>12}  {:>12}",
                        truncate_string(&usage.application, 40),
                        usage.bytes_sent,
                        usage.bytes_recv,
                        usage.total_bytes
                    );
                }
            } else {
                for stat in engine.stats.query(&filter.into_filter()?) {
                    println!(
                        "{}  {:<32}  {:<5}  {:<8}  {:<6}  conns={} sent={} recv={}",
                        stat.timestamp.format("%Y-%m-%d %H:%M"),
                        truncate_string(&stat.application, 32),
                        stat.protocol.as_str(),
                        stat.direction.as_str(),
                        stat.action.as_str(),
                        stat.connections,
                        stat.bytes_sent,
                        stat.bytes_recv
                    );
                }
            }
            let summary = engine.stats.summary();
            println!(
                "Total: {} connections ({} allowed, {} blocked), {} bytes sent, {} bytes received",
                summary.total_connections,
                summary.connections_allowed,
                summary.connections_blocked,
                summary.total_bytes_sent,
                summary.total_bytes_recv
            );
        }
        Commands::Simulate { file } => simulate(engine, file.as_deref()).await?,
        Commands::Version => print_version(),
    }
    Ok(())
}

fn print_version() {
    println!("appwall {}", build::PKG_VERSION);
    println!(
        "commit {}{}",
        build::SHORT_COMMIT,
        if build::GIT_CLEAN { "" } else { " (dirty)" }
    );
    println!("built {}", build::BUILD_TIME);
    println!("rustc {}", build::RUST_VERSION);
}

async fn handle_profiles(
    engine: &Engine,
    action: ProfileCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = &engine.profiles;
    match action {
        ProfileCommand::List => {
            println!("Available profiles (* = active):");
            for p in store.list_profiles().await {
                let marker = if p.active { '*' } else { ' ' };
                let rules = p.rules.len();
                if p.description.is_empty() {
                    println!("  {marker} {} ({rules} rules)", p.name);
                } else {
                    println!("  {marker} {} ({rules} rules) - {}", p.name, p.description);
                }
            }
        }
        ProfileCommand::Create { name, description } => {
            store.create_profile(&name, &description).await?;
            println!("✓ Created profile '{name}'");
        }
        ProfileCommand::Delete { name } => {
            store.delete_profile(&name).await?;
            println!("✓ Deleted profile '{name}'");
        }
        ProfileCommand::Activate { name } => {
            store.set_active(&name).await?;
            println!("✓ Active profile: {name}");
        }
        ProfileCommand::Export { name, output } => {
            let export = store.export_profile(&name).await?;
            let json = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => {
                    write_atomic(&path, json.as_bytes()).await?;
                    println!("✓ Exported '{name}' to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        ProfileCommand::Import { file } => {
            let json = tokio::fs::read_to_string(&file).await?;
            let export: ProfileExport = serde_json::from_str(&json)?;
            let profile = store.import_profile(export).await?;
            println!(
                "✓ Imported profile '{}' ({} rules)",
                profile.name,
                profile.rules.len()
            );
        }
    }
    Ok(())
}

async fn handle_rules(
    engine: &Engine,
    action: RuleCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = &engine.profiles;
    match action {
        RuleCommand::List { profile, all } => {
            let rules = if all {
                store.list_rules().await
            } else {
                let name = profile
                    .or_else(|| store.active_profile_name())
                    .ok_or("No active profile")?;
                store.export_profile(&name).await?.rules
            };
            println!(
                "{:<24}  {:<32}  {:<5}  {:<8}  {:<16}  ACTION",
                "NAME", "APPLICATION", "PROTO", "DIR", "PORTS"
            );
            for rule in rules {
                println!(
                    "{:<24}  {:<32}  {:<5}  {:<8}  {:<16}  {}",
                    rule.name,
                    truncate_string(&rule.application, 32),
                    rule.protocol.as_str(),
                    rule.direction.map_or("any", Direction::as_str),
                    rule.port_display(),
                    rule.action
                );
            }
        }
        RuleCommand::Add {
            profile,
            name,
            app,
            action,
            protocol,
            ports,
            direction,
        } => {
            let rule =
                validators::rule_from_tokens(&name, &app, &action, &protocol, &ports, &direction)?;
            store.add_rule(&profile, rule).await?;
            println!("✓ Added rule '{name}' to '{profile}'");
        }
        RuleCommand::Remove { profile, name } => {
            store.remove_rule(&profile, &name).await?;
            println!("✓ Removed rule '{name}' from '{profile}'");
        }
        RuleCommand::Delete { name } => {
            store.delete_rule(&name).await?;
            println!("✓ Deleted rule '{name}'");
        }
        RuleCommand::Learn {
            profile,
            id,
            action,
        } => {
            let entry = engine
                .log
                .query(Filter::default())
                .find(|e| e.id == id)
                .ok_or_else(|| format!("No decision with id {id} in the log"))?;
            let action = match action {
                Some(token) => parse_action(&token)?,
                None => entry.decision,
            };
            let rule = store.learn_rule(&profile, &entry.event, action).await?;
            println!(
                "✓ Learned rule '{}' ({} {} {}) in '{profile}'",
                rule.name,
                rule.action,
                rule.protocol,
                rule.port_display()
            );
        }
    }
    Ok(())
}

async fn simulate(engine: &Engine, file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match file {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut decisions = engine.pipeline.subscribe();
    let (tx, source) = mpsc::channel::<ConnectionEvent>(64);
    let runner = tokio::spawn(Arc::clone(&engine.pipeline).run(source));

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ConnectionEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => eprintln!("line {line_no}: skipping invalid event: {e}"),
        }
    }
    drop(tx);
    let report = runner.await?;

    let mut entries = Vec::new();
    while let Ok(notification) = decisions.try_recv() {
        if let Notification::Decision(entry) = notification {
            entries.push(entry);
        }
    }
    entries.sort_by_key(|e| e.id);
    for entry in &entries {
        println!(
            "#{:<5} {:<6} {} {} {} port {} -> {}",
            entry.id,
            entry.decision.as_str(),
            entry.event.app_path,
            entry.event.protocol,
            entry.event.direction,
            entry.event.relevant_port(),
            if entry.used_default_policy() {
                "default policy"
            } else {
                entry.rule_name.as_str()
            }
        );
    }
    println!(
        "{} decided, {} not yet durably logged",
        report.handled, report.deferred
    );
    Ok(())
}
