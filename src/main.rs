use std::sync::Arc;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use paladin::admin::Admin;
use paladin::perms::{authority, PermissionEngine};
use paladin::storage::{PermissionStore, SeaOrmStore};
use paladin::{group_sync, jobs, settings, storage, web};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "paladin",
    version,
    about = "Group based permissions for game servers"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the permission read API
    Serve,
    /// Manage groups
    #[command(subcommand)]
    Group(GroupCommand),
    /// Manage a player's permissions and memberships
    #[command(subcommand)]
    User(UserCommand),
    /// Resolve a single permission for a player
    Check { identity: Uuid, permission: String },
    /// Background jobs
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    Create { name: String },
    Delete { name: String },
    List,
    SetPerm {
        group: String,
        node: String,
        #[arg(action = ArgAction::Set, default_value_t = true)]
        value: bool,
    },
    UnsetPerm { group: String, node: String },
    SetPrefix { group: String, prefix: String },
    SetSuffix { group: String, suffix: String },
    SetWeight {
        group: String,
        #[arg(allow_negative_numbers = true)]
        weight: i64,
    },
    SetDisplayName { group: String, display_name: String },
    SetParent { group: String, parent: String },
    ClearParent { group: String },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Info { identity: Uuid },
    SetPerm {
        identity: Uuid,
        node: String,
        #[arg(action = ArgAction::Set, default_value_t = true)]
        value: bool,
    },
    UnsetPerm { identity: Uuid, node: String },
    AddGroup {
        identity: Uuid,
        group: String,
        /// Membership lifetime in seconds; permanent when omitted
        #[arg(long)]
        expires_in: Option<i64>,
    },
    RemoveGroup { identity: Uuid, group: String },
    SetPrimary { identity: Uuid, group: String },
    /// Set the player's own prefix, or clear it when omitted
    SetPrefix { identity: Uuid, prefix: Option<String> },
    /// Set the player's own suffix, or clear it when omitted
    SetSuffix { identity: Uuid, suffix: Option<String> },
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// Run a job once, e.g. prune_expired_memberships
    Run { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    let store: Arc<dyn PermissionStore> = Arc::new(SeaOrmStore::new(db));

    if let Command::Jobs(JobsCommand::Run { name }) = &cli.command {
        let count = jobs::trigger_job_manually(store.as_ref(), name).await?;
        println!("{name}: {count} record(s)");
        return Ok(());
    }

    // probe the external authority once; failures keep the built-in resolver
    let authority = authority::discover(&settings.authority).await;
    let engine =
        Arc::new(PermissionEngine::start(store.clone(), authority, &settings.resolver).await?);

    match cli.command {
        Command::Serve => serve(settings, engine, store).await,
        Command::Group(cmd) => run_group(&engine.admin(), cmd).await,
        Command::User(cmd) => run_user(&engine.admin(), cmd).await,
        Command::Check {
            identity,
            permission,
        } => {
            let allowed = engine
                .resolver()
                .has_permission(identity, &permission)
                .await;
            let verdict = if allowed { "allow" } else { "deny" };
            println!("{identity} {permission}: {verdict}");
            Ok(())
        }
        Command::Jobs(_) => Ok(()),
    }
}

async fn serve(
    settings: settings::Settings,
    engine: Arc<PermissionEngine>,
    store: Arc<dyn PermissionStore>,
) -> Result<()> {
    if let Some(seed_file) = &settings.groups.seed_file {
        if engine.resolver().is_delegating() {
            tracing::warn!("External authority active, skipping group seed file");
        } else {
            group_sync::sync_groups_from_file(engine.groups(), seed_file).await?;
        }
    }

    // keep the scheduler alive for the lifetime of the server
    let _scheduler = if settings.jobs.prune_expired_memberships {
        Some(jobs::init_scheduler(store).await?)
    } else {
        None
    };

    web::serve(&settings, engine).await
}

async fn run_group(admin: &Admin, cmd: GroupCommand) -> Result<()> {
    match cmd {
        GroupCommand::Create { name } => {
            let group = admin.create_group(&name).await?;
            println!("created group {}", group.name);
        }
        GroupCommand::Delete { name } => {
            admin.delete_group(&name).await?;
            println!("deleted group {name}");
        }
        GroupCommand::List => {
            for group in admin.list_groups() {
                println!(
                    "{:<16} weight={:<5} parent={:<12} prefix={:?} suffix={:?} perms={}",
                    group.name,
                    group.weight,
                    group.parent.as_deref().unwrap_or("-"),
                    group.prefix,
                    group.suffix,
                    group.permissions.len()
                );
            }
        }
        GroupCommand::SetPerm { group, node, value } => {
            admin.set_group_permission(&group, &node, value).await?;
        }
        GroupCommand::UnsetPerm { group, node } => {
            admin.unset_group_permission(&group, &node).await?;
        }
        GroupCommand::SetPrefix { group, prefix } => {
            admin.set_group_prefix(&group, &prefix).await?;
        }
        GroupCommand::SetSuffix { group, suffix } => {
            admin.set_group_suffix(&group, &suffix).await?;
        }
        GroupCommand::SetWeight { group, weight } => {
            admin.set_group_weight(&group, weight).await?;
        }
        GroupCommand::SetDisplayName {
            group,
            display_name,
        } => {
            admin.set_group_display_name(&group, &display_name).await?;
        }
        GroupCommand::SetParent { group, parent } => {
            admin.set_group_parent(&group, Some(&parent)).await?;
        }
        GroupCommand::ClearParent { group } => {
            admin.set_group_parent(&group, None).await?;
        }
    }
    Ok(())
}

async fn run_user(admin: &Admin, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Info { identity } => {
            let info = admin.identity_info(identity).await;
            println!("{}", serde_json::to_string_pretty(&info).into_diagnostic()?);
        }
        UserCommand::SetPerm {
            identity,
            node,
            value,
        } => {
            admin.set_identity_permission(identity, &node, value).await?;
        }
        UserCommand::UnsetPerm { identity, node } => {
            admin.unset_identity_permission(identity, &node).await?;
        }
        UserCommand::AddGroup {
            identity,
            group,
            expires_in,
        } => {
            let expires_at = expires_in.map(|secs| Utc::now().timestamp() + secs);
            admin.add_identity_group(identity, &group, expires_at).await?;
        }
        UserCommand::RemoveGroup { identity, group } => {
            if !admin.remove_identity_group(identity, &group).await? {
                println!("{identity} is not a member of {group}");
            }
        }
        UserCommand::SetPrimary { identity, group } => {
            admin.set_identity_primary_group(identity, &group).await?;
        }
        UserCommand::SetPrefix { identity, prefix } => {
            admin.set_identity_prefix(identity, prefix.as_deref()).await?;
        }
        UserCommand::SetSuffix { identity, suffix } => {
            admin.set_identity_suffix(identity, suffix.as_deref()).await?;
        }
    }
    Ok(())
}
