//! pcp - production control for the press line
//!
//! Operator and supervisor commands: start and finish sessions, justify
//! stoppages, and maintain the machine, product and reason catalogs.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/pcp/pcp.db (~/.local/share/pcp/pcp.db)
//! - Logs: $XDG_STATE_HOME/pcp/pcp.log (~/.local/state/pcp/pcp.log)
//! - Config: $XDG_CONFIG_HOME/pcp/config.toml (~/.config/pcp/config.toml)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pcp_core::production::{NewSession, ProductionService};
use pcp_core::store::{
    open_store, ExportQueue, MachineStore, ProductCatalog, PulseStore, SessionFilter,
    SessionStore, StoppageFilter, StoppageStore, SystemClock,
};
use pcp_core::watchdog::{Decision, IdleAssessment, IdleEvaluator};
use pcp_core::{
    Config, ExportStatus, Machine, MachineStoppage, ProductReference, ProductionSession,
    SessionStatus, StoppageClassification, Store,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "pcp")]
#[command(about = "Production control for the press line")]
#[command(version)]
struct Args {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Production sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Machine stoppages
    #[command(subcommand)]
    Stoppage(StoppageCommand),

    /// Stoppage reason catalog
    #[command(subcommand)]
    Reason(ReasonCommand),

    /// Machines on the line
    #[command(subcommand)]
    Machine(MachineCommand),

    /// Product references (ideal cycle time, cavities)
    #[command(subcommand)]
    Product(ProductCommand),

    /// ERP export queue
    #[command(subcommand)]
    Export(ExportCommand),
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Start a session on a machine plate
    Start {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        product: String,
        #[arg(long)]
        operator: String,
        /// Plate (mold position), default 1
        #[arg(long)]
        plate: Option<u32>,
    },
    /// Finish a session and queue it for export
    Finish {
        id: String,
        /// Pieces scrapped during the session
        #[arg(long, default_value = "0")]
        scrap: i64,
    },
    /// List sessions (in progress only unless --all)
    List {
        #[arg(long)]
        machine: Option<String>,
        #[arg(short, long)]
        all: bool,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Show a session with its production and idle state
    Show { id: String },
}

#[derive(Subcommand)]
enum StoppageCommand {
    /// List stoppages, newest first
    List {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        machine: Option<String>,
        /// Only stoppages still waiting for a justification
        #[arg(long)]
        pending: bool,
        /// Only stoppages justified with this reason
        #[arg(long)]
        reason: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Record the reason for a stoppage and close it
    Justify {
        id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, value_enum, default_value = "unplanned")]
        classification: Classification,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Classification {
    Planned,
    Unplanned,
}

impl From<Classification> for StoppageClassification {
    fn from(c: Classification) -> Self {
        match c {
            Classification::Planned => StoppageClassification::Planned,
            Classification::Unplanned => StoppageClassification::Unplanned,
        }
    }
}

#[derive(Subcommand)]
enum ReasonCommand {
    /// List reasons
    List {
        /// Only reasons operators can pick
        #[arg(long)]
        active: bool,
    },
    /// Add a reason
    Add { code: String, description: String },
    /// Change a reason's description
    Rename { code: String, description: String },
    /// Allow a reason to be picked again
    Enable { code: String },
    /// Stop offering a reason for new justifications
    Disable { code: String },
    /// Delete a reason no stoppage uses
    Remove { code: String },
    /// Change the code of a reason no stoppage uses
    Recode { code: String, new_code: String },
}

#[derive(Subcommand)]
enum MachineCommand {
    /// Register or update a machine
    Add {
        /// Number the line controller reports pulses under
        number: String,
        /// Machine id (defaults to the number)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// List machines
    List,
}

#[derive(Subcommand)]
enum ProductCommand {
    /// Create or update a product reference; omitted fields keep their value
    Set {
        code: String,
        /// Ideal cycle time in seconds
        #[arg(long)]
        cycle: Option<u32>,
        /// Pieces per cycle
        #[arg(long)]
        cavities: Option<u32>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Show a product reference
    Show { code: String },
}

#[derive(Subcommand)]
enum ExportCommand {
    /// List export records, oldest first
    List {
        #[arg(long, value_enum)]
        status: Option<ExportFilter>,
    },
    /// Queue a finished session whose export is missing
    Enqueue { session: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFilter {
    Pending,
    Imported,
    Failed,
}

impl From<ExportFilter> for ExportStatus {
    fn from(f: ExportFilter) -> Self {
        match f {
            ExportFilter::Pending => ExportStatus::Pending,
            ExportFilter::Imported => ExportStatus::Imported,
            ExportFilter::Failed => ExportStatus::Failed,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let _log_guard =
        pcp_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let store = open_store(&config.store).context("failed to open store")?;
    let app = App {
        store: store.as_ref(),
        config: &config,
        clock: SystemClock,
        json: args.json,
    };

    match args.command {
        Command::Session(cmd) => app.session(cmd),
        Command::Stoppage(cmd) => app.stoppage(cmd),
        Command::Reason(cmd) => app.reason(cmd),
        Command::Machine(cmd) => app.machine(cmd),
        Command::Product(cmd) => app.product(cmd),
        Command::Export(cmd) => app.export(cmd),
    }
}

struct App<'a> {
    store: &'a dyn Store,
    config: &'a Config,
    clock: SystemClock,
    json: bool,
}

/// Everything `session show` reports
#[derive(Serialize)]
struct SessionDetail<'a> {
    session: &'a ProductionSession,
    total_pieces: i64,
    last_pulse_at: Option<chrono::DateTime<chrono::Utc>>,
    open_stoppage: Option<&'a MachineStoppage>,
    idle: Option<IdleAssessment>,
}

impl<'a> App<'a> {
    fn service(&self) -> ProductionService<'_, dyn Store + 'a> {
        ProductionService::new(self.store, &self.clock)
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }

    fn session(&self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Start {
                machine,
                product,
                operator,
                plate,
            } => {
                let session = self
                    .service()
                    .start_session(NewSession {
                        machine_id: machine,
                        product_code: product,
                        plate,
                        operator_id: operator,
                    })
                    .context("failed to start session")?;
                self.emit(&session, || {
                    println!(
                        "Started session {} on {} plate {}",
                        session.id, session.machine_id, session.plate
                    )
                })
            }
            SessionCommand::Finish { id, scrap } => {
                let (session, export) = self
                    .service()
                    .finish_session(&id, scrap)
                    .context("failed to finish session")?;
                self.emit(&export, || {
                    println!(
                        "Finished session {}: {} piece(s), {} scrapped, export {} queued",
                        session.id, export.total_quantity, session.scrap_count, export.id
                    )
                })
            }
            SessionCommand::List {
                machine,
                all,
                limit,
            } => {
                let filter = SessionFilter {
                    status: (!all).then_some(SessionStatus::InProgress),
                    machine_id: machine,
                    limit: Some(limit),
                    ..Default::default()
                };
                let sessions = self.store.list_sessions(&filter)?;
                self.emit(&sessions, || {
                    if sessions.is_empty() {
                        println!("No sessions.");
                    }
                    for s in &sessions {
                        println!(
                            "{}  {:<10} plate {:<2} {:<14} {:<11} {}",
                            s.id,
                            s.machine_id,
                            s.plate,
                            s.product_code,
                            s.status.as_str(),
                            s.started_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                })
            }
            SessionCommand::Show { id } => {
                let session = self
                    .store
                    .get_session(&id)?
                    .with_context(|| format!("session not found: {}", id))?;
                let total_pieces = self.store.total_pieces(&id)?;
                let last_pulse_at = self.store.latest_pulse(&id)?.map(|p| p.cycle_at);

                let policy = self.config.watchdog.policy();
                let evaluator = IdleEvaluator::new(self.store, &self.clock, policy);
                let (open_stoppage, idle) = if session.is_in_progress() {
                    match evaluator.assess(&session)? {
                        Decision::AlreadyStopped(s) => (Some(s), None),
                        Decision::WithinTolerance(a) | Decision::Stalled(a) => (None, Some(a)),
                    }
                } else {
                    (None, None)
                };

                let detail = SessionDetail {
                    session: &session,
                    total_pieces,
                    last_pulse_at,
                    open_stoppage: open_stoppage.as_ref(),
                    idle,
                };
                self.emit(&detail, || print_session_detail(&detail))
            }
        }
    }

    fn stoppage(&self, cmd: StoppageCommand) -> Result<()> {
        match cmd {
            StoppageCommand::List {
                session,
                machine,
                pending,
                reason,
                limit,
            } => {
                let stoppages = self.store.list_stoppages(&StoppageFilter {
                    session_id: session,
                    machine_id: machine,
                    open_only: pending,
                    reason_code: reason,
                    limit: Some(limit),
                })?;
                let now = chrono::Utc::now();
                self.emit(&stoppages, || {
                    if stoppages.is_empty() {
                        println!("No stoppages.");
                    }
                    for s in &stoppages {
                        println!(
                            "{}  {:<10} {} {:>6}s  {:<9} {}",
                            s.id,
                            s.machine_id,
                            s.started_at.format("%Y-%m-%d %H:%M:%S"),
                            s.duration_secs(now),
                            s.classification.as_str(),
                            match (&s.reason_code, s.is_open()) {
                                (Some(code), _) => code.as_str(),
                                (None, true) => "(pending)",
                                (None, false) => "-",
                            }
                        );
                    }
                })
            }
            StoppageCommand::Justify {
                id,
                reason,
                classification,
            } => {
                let stoppage = self
                    .service()
                    .justify_stoppage(&id, &reason, Some(classification.into()))
                    .context("failed to justify stoppage")?;
                self.emit(&stoppage, || {
                    println!(
                        "Stoppage {} justified as {} ({})",
                        stoppage.id, reason, stoppage.classification
                    )
                })
            }
        }
    }

    fn reason(&self, cmd: ReasonCommand) -> Result<()> {
        let service = self.service();
        let reason = match cmd {
            ReasonCommand::List { active } => {
                let reasons = service.list_reasons(active)?;
                return self.emit(&reasons, || {
                    for r in &reasons {
                        println!(
                            "{:<8} {}{}",
                            r.code,
                            r.description,
                            if r.active { "" } else { " (inactive)" }
                        );
                    }
                });
            }
            ReasonCommand::Add { code, description } => service.add_reason(&code, &description),
            ReasonCommand::Rename { code, description } => {
                service.rename_reason(&code, &description)
            }
            ReasonCommand::Enable { code } => service.set_reason_active(&code, true),
            ReasonCommand::Disable { code } => service.set_reason_active(&code, false),
            ReasonCommand::Remove { code } => {
                service
                    .remove_reason(&code)
                    .context("failed to remove reason")?;
                return self.emit(&serde_json::json!({ "removed": code }), || {
                    println!("Reason {} removed", code)
                });
            }
            ReasonCommand::Recode { code, new_code } => service.recode_reason(&code, &new_code),
        }
        .context("failed to update reason")?;

        self.emit(&reason, || {
            println!(
                "{} {} ({})",
                reason.code,
                reason.description,
                if reason.active { "active" } else { "inactive" }
            )
        })
    }

    fn machine(&self, cmd: MachineCommand) -> Result<()> {
        match cmd {
            MachineCommand::Add { number, id, name } => {
                let machine = Machine {
                    id: id.unwrap_or_else(|| number.clone()),
                    number,
                    name,
                };
                self.store
                    .upsert_machine(&machine)
                    .context("failed to save machine")?;
                self.emit(&machine, || {
                    println!("Machine {} (number {})", machine.id, machine.number)
                })
            }
            MachineCommand::List => {
                let machines = self.store.list_machines()?;
                self.emit(&machines, || {
                    for m in &machines {
                        println!(
                            "{:<10} number {:<6} {}",
                            m.id,
                            m.number,
                            m.name.as_deref().unwrap_or("")
                        );
                    }
                })
            }
        }
    }

    fn product(&self, cmd: ProductCommand) -> Result<()> {
        match cmd {
            ProductCommand::Set {
                code,
                cycle,
                cavities,
                description,
            } => {
                let existing = self.store.product(&code)?;
                let product = ProductReference {
                    description: description
                        .or_else(|| existing.as_ref().and_then(|p| p.description.clone())),
                    ideal_cycle_secs: cycle
                        .or_else(|| existing.as_ref().and_then(|p| p.ideal_cycle_secs)),
                    cavities: cavities
                        .or_else(|| existing.as_ref().map(|p| p.cavities))
                        .unwrap_or(1),
                    code,
                };
                if product.cavities == 0 {
                    anyhow::bail!("cavities must be at least 1");
                }
                self.store
                    .upsert_product(&product)
                    .context("failed to save product")?;
                self.emit(&product, || print_product(&product))
            }
            ProductCommand::Show { code } => {
                let product = self
                    .store
                    .product(&code)?
                    .with_context(|| format!("product not found: {}", code))?;
                self.emit(&product, || print_product(&product))
            }
        }
    }

    fn export(&self, cmd: ExportCommand) -> Result<()> {
        let status = match cmd {
            ExportCommand::List { status } => status,
            ExportCommand::Enqueue { session } => {
                let export = self
                    .service()
                    .enqueue_export(&session)
                    .context("failed to queue export")?;
                return self.emit(&export, || {
                    println!(
                        "Export {} queued for session {}: {} piece(s)",
                        export.id, export.session_id, export.total_quantity
                    )
                });
            }
        };
        let records = self.store.list_exports(status.map(Into::into))?;
        self.emit(&records, || {
            if records.is_empty() {
                println!("Export queue is empty.");
            }
            for r in &records {
                println!(
                    "{}  session {}  {:<14} {:>8}  {}",
                    r.id,
                    r.session_id,
                    r.item_code.as_deref().unwrap_or("-"),
                    r.total_quantity,
                    r.status.as_str()
                );
            }
        })
    }
}

fn print_session_detail(detail: &SessionDetail<'_>) {
    let s = detail.session;
    println!("Session   {}", s.id);
    println!("Machine   {} plate {}", s.machine_id, s.plate);
    println!("Product   {}", s.product_code);
    println!("Operator  {}", s.operator_id);
    println!("Status    {}", s.status);
    println!("Started   {}", s.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ended) = s.ended_at {
        println!("Ended     {}", ended.format("%Y-%m-%d %H:%M:%S"));
        println!("Scrap     {}", s.scrap_count);
    }
    println!("Pieces    {}", detail.total_pieces);
    match detail.last_pulse_at {
        Some(at) => println!("Last pulse {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("Last pulse (none)"),
    }
    if let Some(stoppage) = detail.open_stoppage {
        println!(
            "Stopped since {} (stoppage {})",
            stoppage.started_at.format("%H:%M:%S"),
            stoppage.id
        );
    }
    if let Some(a) = &detail.idle {
        println!(
            "Idle      {}s of {:.0}s tolerated{}",
            a.idle_secs,
            a.threshold_secs,
            if a.stalled { " - STALLED" } else { "" }
        );
    }
}

fn print_product(p: &ProductReference) {
    println!(
        "{}  cycle {}  cavities {}  {}",
        p.code,
        p.ideal_cycle_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "-".to_string()),
        p.cavities,
        p.description.as_deref().unwrap_or("")
    );
}
