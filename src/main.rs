use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "eta", version, about = "Exchange Trace Archiver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Path to the sqlite database (defaults to ~/.eta/eta.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull message traces for one tenant or all active tenants
    Pull(PullArgs),
    /// Run the daily scheduled-pull loop in the foreground
    Scheduler {
        /// Fire an immediate pull before waiting for the schedule
        #[arg(long)]
        run_now: bool,
    },
    /// Re-derive trace directions from a tenant's current domain list
    FixDirections(FixDirectionsArgs),
    /// Discover verified domains from the tenant's transport
    DiscoverDomains(DiscoverDomainsArgs),
    /// Manage tenant configuration
    Tenants {
        #[command(subcommand)]
        command: TenantCommands,
    },
    /// Query archived message traces
    Traces(TracesArgs),
    /// Show pull history
    History(HistoryArgs),
    /// Show or change application settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Show database statistics
    Stats,
}

#[derive(Debug, Args)]
struct PullArgs {
    /// Tenant id or name; omit with --all to pull every active tenant
    #[arg(long)]
    tenant: Option<String>,
    /// Pull every active tenant
    #[arg(long)]
    all: bool,
    /// Range start, YYYY-MM-DD or RFC 3339 (UTC)
    #[arg(long)]
    start_date: Option<String>,
    /// Range end, YYYY-MM-DD or RFC 3339 (UTC)
    #[arg(long)]
    end_date: Option<String>,
    /// Pull the last N days up to now
    #[arg(long)]
    days: Option<u32>,
    /// Resolve the range and report without pulling
    #[arg(long)]
    dry_run: bool,
    /// Recorded in pull history as the initiator
    #[arg(long, default_value = "cli")]
    triggered_by: String,
}

#[derive(Debug, Args)]
struct FixDirectionsArgs {
    /// Tenant id or name
    #[arg(long)]
    tenant: String,
    /// Report changes without writing them
    #[arg(long)]
    dry_run: bool,
    /// Rows examined per transaction (0 = default)
    #[arg(long, default_value_t = 0)]
    batch_size: usize,
}

#[derive(Debug, Args)]
struct DiscoverDomainsArgs {
    /// Tenant id or name; omit with --all for every active tenant
    #[arg(long)]
    tenant: Option<String>,
    /// Discover for every active tenant
    #[arg(long)]
    all: bool,
    /// Replace an already-configured domain list
    #[arg(long)]
    overwrite: bool,
    /// Report what would be stored without writing it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct TracesArgs {
    /// Tenant id or name
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long)]
    sender: Option<String>,
    #[arg(long)]
    recipient: Option<String>,
    /// Delivery status (Delivered, Failed, Pending, ...)
    #[arg(long)]
    status: Option<String>,
    /// Direction (Inbound, Outbound, Internal, Unknown)
    #[arg(long)]
    direction: Option<String>,
    /// Received on or after, YYYY-MM-DD or RFC 3339 (UTC)
    #[arg(long)]
    since: Option<String>,
    /// Received before, YYYY-MM-DD or RFC 3339 (UTC)
    #[arg(long)]
    until: Option<String>,
    /// Substring match on sender, recipient, subject or message id
    #[arg(long)]
    query: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    /// Tenant id or name
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
enum TenantCommands {
    /// Add a tenant
    Add(TenantAddArgs),
    /// List tenants
    List {
        /// Include disabled tenants
        #[arg(long)]
        all: bool,
    },
    /// Show one tenant by id or name
    Show { tenant: String },
    /// Remove a tenant and its archived traces
    Remove { tenant: String },
    /// Replace a tenant's internal domain list
    SetDomains {
        tenant: String,
        /// Comma-separated domains
        domains: String,
    },
    /// Enable a tenant for pulls
    Enable { tenant: String },
    /// Disable a tenant without removing its data
    Disable { tenant: String },
}

#[derive(Debug, Args)]
struct TenantAddArgs {
    /// Display name, unique across tenants
    name: String,
    /// Entra ID tenant GUID
    #[arg(long)]
    tenant_id: String,
    /// Entra ID application (client) GUID
    #[arg(long)]
    client_id: String,
    /// certificate or secret
    #[arg(long)]
    auth_method: String,
    #[arg(long)]
    client_secret: Option<String>,
    /// Path to a PEM certificate with its private key
    #[arg(long)]
    certificate_path: Option<String>,
    /// SHA-1 thumbprint, required for the PowerShell transport
    #[arg(long)]
    certificate_thumbprint: Option<String>,
    #[arg(long)]
    certificate_password: Option<String>,
    /// graph or powershell
    #[arg(long, default_value = "graph")]
    api_method: String,
    /// Exchange organization, e.g. contoso.onmicrosoft.com
    #[arg(long)]
    organization: Option<String>,
    /// Comma-separated internal domains
    #[arg(long)]
    domains: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommands {
    /// Show current settings
    Show,
    /// Set one setting by key
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{anyhow, bail, Context, Result};
    use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};

    use eta::clients::client_for_tenant;
    use eta::db::models::{ApiMethod, AuthMethod, Tenant, TriggerType};
    use eta::db::{Database, NewTenant, TraceFilters};
    use eta::domains::{self, DiscoverOutcome};
    use eta::output::{self, OutputFormat, TenantSummary};
    use eta::pull::{self, PullRequest};
    use eta::reconcile;
    use eta::scheduler;
    use eta::settings::AppSettings;

    use super::{Cli, Commands, SettingsCommands, TenantCommands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let db = open_database(cli.db.as_deref())?;
        match cli.command {
            Commands::Pull(args) => handle_pull(&db, args, cli.json).await,
            Commands::Scheduler { run_now } => scheduler::run(&db, run_now).await,
            Commands::FixDirections(args) => handle_fix_directions(&db, args, cli.json),
            Commands::DiscoverDomains(args) => handle_discover_domains(&db, args, cli.json).await,
            Commands::Tenants { command } => handle_tenants(&db, command, cli.json),
            Commands::Traces(args) => handle_traces(&db, args, cli.json),
            Commands::History(args) => handle_history(&db, args, cli.json),
            Commands::Settings { command } => handle_settings(&db, command, cli.json),
            Commands::Stats => handle_stats(&db, cli.json),
        }
    }

    fn open_database(path: Option<&std::path::Path>) -> Result<Database> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Database::default_db_path().context("resolve default database path")?,
        };
        Database::open(&path).with_context(|| format!("open database at {}", path.display()))
    }

    async fn handle_pull(db: &Database, args: super::PullArgs, json: bool) -> Result<()> {
        if args.tenant.is_none() && !args.all {
            bail!("pass --tenant <id-or-name> or --all");
        }

        let request = PullRequest {
            start: parse_instant_arg("start-date", args.start_date.as_deref())?,
            end: parse_instant_arg("end-date", args.end_date.as_deref())?,
            days: args.days,
            trigger_type: TriggerType::Manual,
            triggered_by: args.triggered_by,
            dry_run: args.dry_run,
        };
        let settings = AppSettings::load(db)?;

        let outcomes = match args.tenant {
            Some(selector) => {
                let tenant = resolve_tenant(db, &selector)?;
                vec![pull::pull_tenant(db, &settings, &tenant, &request).await?]
            }
            None => pull::pull_all_tenants(db, &settings, &request).await?,
        };

        let formatted =
            output::format_pull_outcomes(OutputFormat::from_json_flag(json), &outcomes)?;
        println!("{formatted}");

        if outcomes.iter().any(|outcome| !outcome.error_message.is_empty()) {
            std::process::exit(1);
        }
        Ok(())
    }

    fn handle_fix_directions(db: &Database, args: super::FixDirectionsArgs, json: bool) -> Result<()> {
        let tenant = resolve_tenant(db, &args.tenant)?;
        let internal_domains = domains::resolve_domains(&tenant);
        if internal_domains.is_empty() {
            bail!(
                "tenant '{}' has no internal domains; run 'eta discover-domains --tenant {}' \
                 or 'eta tenants set-domains' first",
                tenant.name,
                tenant.name
            );
        }

        let outcome = reconcile::recompute_directions(
            db,
            &tenant,
            &internal_domains,
            args.batch_size,
            args.dry_run,
        )?;

        if json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            let verb = if args.dry_run { "would change" } else { "changed" };
            println!(
                "Examined {} traces, {verb} {}.",
                outcome.examined, outcome.changed
            );
            for (direction, count) in &outcome.by_direction {
                println!("  {direction}: {count}");
            }
        }
        Ok(())
    }

    async fn handle_discover_domains(
        db: &Database,
        args: super::DiscoverDomainsArgs,
        json: bool,
    ) -> Result<()> {
        let tenants = match args.tenant {
            Some(ref selector) => vec![resolve_tenant(db, selector)?],
            None if args.all => db.list_tenants(true)?,
            None => bail!("pass --tenant <id-or-name> or --all"),
        };

        let mut results = Vec::with_capacity(tenants.len());
        for tenant in &tenants {
            let outcome = discover_for_tenant(db, tenant, args.overwrite, args.dry_run).await;
            results.push((tenant.name.clone(), outcome));
        }

        if json {
            let payload: Vec<serde_json::Value> = results
                .iter()
                .map(|(name, outcome)| match outcome {
                    Ok(outcome) => serde_json::json!({
                        "tenant": name,
                        "result": outcome,
                    }),
                    Err(e) => serde_json::json!({
                        "tenant": name,
                        "error": format!("{e:#}"),
                    }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else {
            for (name, outcome) in &results {
                match outcome {
                    Ok(outcome) => println!("{name}: {}", describe_discovery(outcome)),
                    Err(e) => println!("{name}: error: {e:#}"),
                }
            }
        }

        if results.iter().any(|(_, outcome)| outcome.is_err()) {
            std::process::exit(1);
        }
        Ok(())
    }

    async fn discover_for_tenant(
        db: &Database,
        tenant: &Tenant,
        overwrite: bool,
        dry_run: bool,
    ) -> Result<DiscoverOutcome> {
        let mut client = client_for_tenant(tenant)?;
        client.authenticate().await?;
        domains::discover_domains(db, client.as_mut(), tenant, overwrite, dry_run).await
    }

    fn describe_discovery(outcome: &DiscoverOutcome) -> String {
        match outcome {
            DiscoverOutcome::Updated { domains } => {
                format!("updated ({})", domains.join(", "))
            }
            DiscoverOutcome::WouldUpdate { domains } => {
                format!("would update ({})", domains.join(", "))
            }
            DiscoverOutcome::SkippedConfigured => {
                "skipped, domains already configured (use --overwrite to replace)".to_string()
            }
            DiscoverOutcome::NotSupported => {
                "transport does not support domain discovery".to_string()
            }
            DiscoverOutcome::Empty => "no verified domains returned".to_string(),
        }
    }

    fn handle_tenants(db: &Database, command: TenantCommands, json: bool) -> Result<()> {
        match command {
            TenantCommands::Add(args) => {
                let auth_method: AuthMethod = args
                    .auth_method
                    .parse()
                    .map_err(|e: String| anyhow!(e))?;
                let api_method: ApiMethod = args
                    .api_method
                    .parse()
                    .map_err(|e: String| anyhow!(e))?;
                let tenant = NewTenant {
                    name: args.name.trim().to_string(),
                    tenant_id: args.tenant_id.trim().to_string(),
                    client_id: args.client_id.trim().to_string(),
                    auth_method,
                    client_secret: args.client_secret,
                    certificate_path: args.certificate_path,
                    certificate_thumbprint: args.certificate_thumbprint,
                    certificate_password: args.certificate_password,
                    api_method,
                    organization: args.organization,
                    domains: args.domains,
                };
                validate_new_tenant(&tenant)?;
                let id = db.insert_tenant(&tenant)?;
                println!("Added tenant '{}' (id {id})", tenant.name);
            }
            TenantCommands::List { all } => {
                let tenants = db.list_tenants(!all)?;
                let summaries: Vec<TenantSummary> =
                    tenants.iter().map(TenantSummary::from_tenant).collect();
                let formatted =
                    output::format_tenants(OutputFormat::from_json_flag(json), &summaries)?;
                println!("{formatted}");
            }
            TenantCommands::Show { tenant } => {
                let tenant = resolve_tenant(db, &tenant)?;
                let formatted = output::format_tenant(
                    OutputFormat::from_json_flag(json),
                    &TenantSummary::from_tenant(&tenant),
                )?;
                println!("{formatted}");
            }
            TenantCommands::Remove { tenant } => {
                let tenant = resolve_tenant(db, &tenant)?;
                db.remove_tenant(tenant.id)?;
                println!("Removed tenant '{}' and its traces", tenant.name);
            }
            TenantCommands::SetDomains { tenant, domains } => {
                let tenant = resolve_tenant(db, &tenant)?;
                let cleaned = domains::split_domain_list(&domains);
                if cleaned.is_empty() {
                    bail!("no usable domains in '{domains}'");
                }
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                db.update_tenant_domains(tenant.id, &cleaned.join(","), &now)?;
                println!("Set domains for '{}': {}", tenant.name, cleaned.join(", "));
            }
            TenantCommands::Enable { tenant } => {
                let tenant = resolve_tenant(db, &tenant)?;
                db.set_tenant_active(tenant.id, true)?;
                println!("Enabled tenant '{}'", tenant.name);
            }
            TenantCommands::Disable { tenant } => {
                let tenant = resolve_tenant(db, &tenant)?;
                db.set_tenant_active(tenant.id, false)?;
                println!("Disabled tenant '{}'", tenant.name);
            }
        }
        Ok(())
    }

    fn validate_new_tenant(tenant: &NewTenant) -> Result<()> {
        if tenant.name.is_empty() {
            bail!("tenant name must not be empty");
        }
        match tenant.auth_method {
            AuthMethod::Secret if tenant.client_secret.is_none() => {
                bail!("--client-secret is required with --auth-method secret");
            }
            AuthMethod::Certificate if tenant.certificate_path.is_none() => {
                bail!("--certificate-path is required with --auth-method certificate");
            }
            _ => {}
        }
        if tenant.api_method == ApiMethod::Powershell && tenant.organization.is_none() {
            bail!("--organization is required with --api-method powershell");
        }
        Ok(())
    }

    fn handle_traces(db: &Database, args: super::TracesArgs, json: bool) -> Result<()> {
        let tenant_id = args
            .tenant
            .as_deref()
            .map(|selector| resolve_tenant(db, selector).map(|tenant| tenant.id))
            .transpose()?;

        let traces = db.search_traces(TraceFilters {
            tenant_id,
            sender: args.sender,
            recipient: args.recipient,
            status: args.status,
            direction: args.direction,
            since: parse_instant_arg("since", args.since.as_deref())?
                .map(|instant| instant.to_rfc3339_opts(SecondsFormat::Micros, true)),
            until: parse_instant_arg("until", args.until.as_deref())?
                .map(|instant| instant.to_rfc3339_opts(SecondsFormat::Micros, true)),
            query: args.query,
            limit: args.limit,
            offset: args.offset,
        })?;

        let formatted = output::format_traces(OutputFormat::from_json_flag(json), &traces)?;
        println!("{formatted}");
        Ok(())
    }

    fn handle_history(db: &Database, args: super::HistoryArgs, json: bool) -> Result<()> {
        let tenant_id = args
            .tenant
            .as_deref()
            .map(|selector| resolve_tenant(db, selector).map(|tenant| tenant.id))
            .transpose()?;

        let history = db.list_pull_history(tenant_id, args.limit)?;
        let formatted = output::format_history(OutputFormat::from_json_flag(json), &history)?;
        println!("{formatted}");
        Ok(())
    }

    fn handle_settings(db: &Database, command: SettingsCommands, json: bool) -> Result<()> {
        match command {
            SettingsCommands::Show => {
                let settings = AppSettings::load(db)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                } else {
                    println!(
                        "domain_discovery_auto_refresh  {}",
                        settings.domain_discovery_auto_refresh
                    );
                    println!(
                        "domain_discovery_refresh_hours {}",
                        settings.domain_discovery_refresh_hours
                    );
                    println!(
                        "scheduled_pull_enabled         {}",
                        settings.scheduled_pull_enabled
                    );
                    println!(
                        "scheduled_pull_time            {:02}:{:02} UTC",
                        settings.scheduled_pull_hour, settings.scheduled_pull_minute
                    );
                }
            }
            SettingsCommands::Set { key, value } => {
                let mut settings = AppSettings::load(db)?;
                apply_setting(&mut settings, key.trim(), value.trim())?;
                settings.save(db)?;
                println!("Set {key} = {value}");
            }
        }
        Ok(())
    }

    fn apply_setting(settings: &mut AppSettings, key: &str, value: &str) -> Result<()> {
        match key {
            "domain_discovery_auto_refresh" => {
                settings.domain_discovery_auto_refresh = parse_bool_arg(key, value)?;
            }
            "domain_discovery_refresh_hours" => {
                settings.domain_discovery_refresh_hours = value
                    .parse()
                    .with_context(|| format!("invalid value '{value}' for {key}"))?;
            }
            "scheduled_pull_enabled" => {
                settings.scheduled_pull_enabled = parse_bool_arg(key, value)?;
            }
            "scheduled_pull_hour" => {
                settings.scheduled_pull_hour = value
                    .parse()
                    .with_context(|| format!("invalid value '{value}' for {key}"))?;
            }
            "scheduled_pull_minute" => {
                settings.scheduled_pull_minute = value
                    .parse()
                    .with_context(|| format!("invalid value '{value}' for {key}"))?;
            }
            other => bail!(
                "unknown setting '{other}'; known keys: domain_discovery_auto_refresh, \
                 domain_discovery_refresh_hours, scheduled_pull_enabled, scheduled_pull_hour, \
                 scheduled_pull_minute"
            ),
        }
        Ok(())
    }

    fn parse_bool_arg(key: &str, value: &str) -> Result<bool> {
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            other => bail!("invalid value '{other}' for {key}, expected true or false"),
        }
    }

    fn handle_stats(db: &Database, json: bool) -> Result<()> {
        let stats = db.get_stats()?;
        let formatted = output::format_stats(OutputFormat::from_json_flag(json), &stats)?;
        println!("{formatted}");
        Ok(())
    }

    fn resolve_tenant(db: &Database, selector: &str) -> Result<Tenant> {
        db.find_tenant(selector)?
            .ok_or_else(|| anyhow!("tenant not found: {selector}"))
    }

    /// Accepts either an RFC 3339 instant or a bare date taken as UTC
    /// midnight.
    fn parse_instant_arg(label: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let raw = raw.trim();

        if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(instant.with_timezone(&Utc)));
        }
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| {
            format!("invalid --{label} value '{raw}', expected YYYY-MM-DD or RFC 3339")
        })?;
        let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        Ok(Some(Utc.from_utc_datetime(&midnight)))
    }
}
