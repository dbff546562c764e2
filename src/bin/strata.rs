use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use strata_wm::common::config::{Config, config_file};
use strata_wm::common::log;
use strata_wm::engine::transition::{NoopTransitionPlayer, TransitionKind};
use strata_wm::model::configuration::{Rect, WindowingMode};
use strata_wm::model::container::FragmentToken;
use strata_wm::organizer::error::DeliveryError;
use strata_wm::organizer::events::OrganizerTransaction;
use strata_wm::organizer::launcher::ImmediateLauncher;
use strata_wm::organizer::registry::OrganizerEndpoint;
use strata_wm::organizer::transaction::{
    FragmentCreationParams, HierarchyOp, WindowContainerTransaction,
};
use strata_wm::organizer::{CallerInfo, DefaultPolicy, WindowOrganizerService};

#[derive(Parser)]
struct Cli {
    /// Path to configuration file to use (overrides default).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration file without starting anything.
    Validate,
    /// Build a sample hierarchy with an embedded split and print it.
    Demo,
}

/// Demo organizer that prints every event batch it receives.
struct PrintingOrganizer;

impl OrganizerEndpoint for PrintingOrganizer {
    fn on_transaction_ready(
        &self,
        transaction: OrganizerTransaction,
    ) -> Result<(), DeliveryError> {
        for change in &transaction.changes {
            println!("organizer event: {change:?}");
        }
        Ok(())
    }
}

fn main() {
    log::init_logging();
    let opt = Cli::parse();

    let config_path = opt.config.clone().unwrap_or_else(config_file);
    let config = if config_path.exists() {
        match Config::read(&config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}: {err:#}", config_path.display());
                process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    match opt.command {
        Commands::Validate => {
            let issues = config.validate();
            if issues.is_empty() {
                println!("Config validation passed");
            } else {
                for issue in issues {
                    eprintln!("{issue}");
                }
                process::exit(1);
            }
        }
        Commands::Demo => demo(&config),
    }
}

fn demo(config: &Config) {
    let service = WindowOrganizerService::new(
        config,
        Arc::new(ImmediateLauncher),
        Arc::new(DefaultPolicy),
        Arc::new(NoopTransitionPlayer),
    );
    let system = CallerInfo::privileged();
    let app = CallerInfo::app(process::id(), 10_001);

    let display = service.create_display_area();
    let task = service.create_task(display, app.uid).unwrap();
    let activity = service.create_activity(task, app.uid, app.pid).unwrap();

    let mut bounds = WindowContainerTransaction::new();
    bounds.set_bounds(task, Rect::new(0, 0, 1200, 800));
    service.apply_transaction(&bounds, &system).unwrap();

    let organizer = service.register_organizer(Arc::new(PrintingOrganizer), &app).unwrap();
    let mut split = WindowContainerTransaction::new();
    split.set_organizer(organizer).add_op(HierarchyOp::CreateTaskFragment {
        params: FragmentCreationParams {
            organizer,
            fragment_token: FragmentToken(1),
            owner_activity: activity,
            windowing_mode: WindowingMode::MultiWindow,
            initial_bounds: Rect::new(600, 0, 1200, 800),
            paired_primary: None,
            paired_activity: None,
        },
    });
    service.apply_fragment_transaction(&split, TransitionKind::Open, false, &app).unwrap();

    print!("{}", service.dump());
}
