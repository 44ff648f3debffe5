use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

mod config;
mod db;
mod error;
mod filter;
mod models;
mod report;
mod runner;
mod server;
mod store;
mod window;

use config::DatabaseConfig;
use db::PgStore;
use models::{Group, GroupInput};
use runner::FilterRunner;
use store::AttendanceStore;

#[derive(Parser)]
#[command(name = "roll-groups")]
#[command(about = "Attendance-driven student groups for Group Scholar", long_about = None)]
struct Cli {
    #[command(flatten)]
    db: DatabaseConfig,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import roll states from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Recompute the membership of every group
    RunFilters,
    /// List groups with their last run
    Groups,
    /// List the students currently in a group
    GroupStudents {
        #[arg(long)]
        id: i32,
    },
    /// Add a group
    CreateGroup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        number_of_weeks: i32,
        /// Comma-separated: unmark, present, absent, late
        #[arg(long)]
        roll_states: String,
        #[arg(long)]
        incidents: i32,
        /// `<` for at most, `>` for at least
        #[arg(long)]
        ltmt: String,
    },
    /// Change fields of an existing group
    UpdateGroup {
        #[arg(long)]
        id: i32,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        number_of_weeks: Option<i32>,
        #[arg(long)]
        roll_states: Option<String>,
        #[arg(long)]
        incidents: Option<i32>,
        #[arg(long)]
        ltmt: Option<String>,
    },
    /// Remove a group and its members
    DeleteGroup {
        #[arg(long)]
        id: i32,
    },
    /// Generate a markdown report of every group
    Report {
        #[arg(long, default_value = "groups.md")]
        out: PathBuf,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, env = "ROLL_GROUPS_BIND", default_value = "127.0.0.1:4001")]
        bind: SocketAddr,
    },
}

fn print_group(group: &Group) {
    let last_run = group
        .run_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "- [{}] {} ({} {} of {} in {} weeks): {} students, last run {}",
        group.id,
        group.name,
        group.ltmt,
        group.incidents,
        group.roll_states,
        group.number_of_weeks,
        group.student_count,
        last_run
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    config::init_tracing(cli.verbose);

    let pool = cli.db.connect().await?;
    let store = Arc::new(PgStore::new(pool.clone()));

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} new roll states from {}.", csv.display());
        }
        Commands::RunFilters => {
            let runner = FilterRunner::new(store);
            let groups = runner.run_filters().await?;
            if groups.is_empty() {
                println!("No groups configured.");
                return Ok(());
            }
            println!("Refreshed {} groups:", groups.len());
            for group in &groups {
                print_group(group);
            }
        }
        Commands::Groups => {
            let groups = store.list_groups().await?;
            if groups.is_empty() {
                println!("No groups configured.");
            }
            for group in &groups {
                print_group(group);
            }
        }
        Commands::GroupStudents { id } => {
            let members = store.list_group_members(id).await?;
            if members.is_empty() {
                println!("No students in group {id}.");
            }
            for member in &members {
                println!(
                    "- {} (#{}) with {} incidents",
                    member.full_name, member.student_id, member.incident_count
                );
            }
        }
        Commands::CreateGroup {
            name,
            number_of_weeks,
            roll_states,
            incidents,
            ltmt,
        } => {
            let input = GroupInput {
                name: Some(name),
                number_of_weeks: Some(number_of_weeks),
                roll_states: Some(roll_states),
                incidents: Some(incidents),
                ltmt: Some(ltmt),
            };
            let group = store.create_group(input.into_new_group()?).await?;
            println!("Created group {}.", group.id);
            print_group(&group);
        }
        Commands::UpdateGroup {
            id,
            name,
            number_of_weeks,
            roll_states,
            incidents,
            ltmt,
        } => {
            let input = GroupInput {
                name,
                number_of_weeks,
                roll_states,
                incidents,
                ltmt,
            };
            match store.update_group(id, input.into_patch()?).await? {
                Some(group) => print_group(&group),
                None => println!("No group with id {id}; nothing changed."),
            }
        }
        Commands::DeleteGroup { id } => match store.delete_group(id).await? {
            Some(group) => println!("Deleted group {} ({}).", group.id, group.name),
            None => println!("No group with id {id}; nothing deleted."),
        },
        Commands::Report { out } => {
            let mut sections = Vec::new();
            for group in store.list_groups().await? {
                let members = store.list_group_members(group.id).await?;
                sections.push((group, members));
            }
            std::fs::write(&out, report::build_report(&sections))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Serve { bind } => {
            let runner = Arc::new(FilterRunner::new(store));
            server::serve(runner, bind).await?;
        }
    }

    Ok(())
}
