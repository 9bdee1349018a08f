//! prm - remote connection catalog
//!
//! Command-line front end over the server registry: list, add, edit and
//! delete stored servers, and manage tags.

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use prm::{
    config::{self, AppConfig},
    preferences::{Preferences, PreferencesError, TomlPreferences},
    record::{ConnectionFields, ProtocolKind, SealedFields, ServerId, ServerRecord},
    registry::{AutoReload, RegistryError, ServerEntry, ServerRegistry},
    store::{JsonFileStore, StoreError},
};

/// prm - remote connection catalog
#[derive(ClapParser, Debug)]
#[command(name = "prm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(long, env = "PRM_CONFIG")]
    config: Option<PathBuf>,

    /// Server store file (overrides the config file)
    #[arg(long, env = "PRM_DATA_FILE")]
    data_file: Option<PathBuf>,

    /// Preferences file (overrides the config file)
    #[arg(long)]
    preferences: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List servers
    List {
        /// Only servers carrying this tag
        #[arg(long, conflicts_with = "filter")]
        tag: Option<String>,

        /// Case-insensitive match on name, subtitle and tags
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show one server
    Show {
        id: i64,
    },

    /// Add a server
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        protocol: ProtocolKind,

        #[arg(long)]
        address: String,

        /// Defaults to the protocol's well-known port
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long, default_value = "")]
        subtitle: String,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Edit a server
    Update {
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        subtitle: Option<String>,

        /// Replace the tag list
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Remove all tags
        #[arg(long, conflicts_with = "tags")]
        clear_tags: bool,
    },

    /// Delete a server
    Delete {
        id: i64,
    },

    /// List tags with usage counts
    Tags,

    /// Toggle whether a tag is pinned
    Pin {
        tag: String,
    },

    /// Remember a tag as the selected main-window tab ("" for all)
    SelectTag {
        tag: String,
    },
}

#[derive(Debug, Error)]
pub enum PrmError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("preferences error: {0}")]
    Preferences(#[from] PreferencesError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no server with id {0}")]
    NotFound(ServerId),

    #[error("server id must be positive, got {0}")]
    InvalidId(i64),
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("prm: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), PrmError> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let app_config = AppConfig::load_or_default(&config_path)?;
    init_tracing(app_config.log_filter());

    let data_file = cli.data_file.clone().unwrap_or_else(|| app_config.data_file());
    let preferences_file = cli.preferences.clone().unwrap_or_else(|| app_config.preferences_file());
    tracing::debug!(data = %data_file.display(), preferences = %preferences_file.display(), "starting");

    let preferences = Arc::new(TomlPreferences::load(preferences_file)?);
    let registry = ServerRegistry::new(preferences.clone());
    registry.attach_store(Arc::new(JsonFileStore::open(data_file)?));
    registry.reload()?;

    match cli.command {
        Commands::List { tag, filter } => {
            if let Some(tag) = tag {
                registry.set_selected_tag(&tag);
            }
            if let Some(filter) = filter {
                registry.set_free_text_filter(&filter);
            }
            for entry in registry.visible_servers() {
                print_row(&entry);
            }
        }
        Commands::Show { id } => {
            let entry = registry.get(server_id(id)?).ok_or(PrmError::NotFound(ServerId(id)))?;
            print_details(&entry);
        }
        Commands::Add { name, protocol, address, port, user, subtitle, tags } => {
            let fields = ConnectionFields {
                address,
                port: port.unwrap_or_else(|| protocol.default_port()),
                username: user,
                ..Default::default()
            };
            let record = ServerRecord::new(name, protocol, fields)
                .with_subtitle(subtitle)
                .with_tags(tags);
            let id = registry.add_server(record, AutoReload::Reload)?;
            println!("{id}");
        }
        Commands::Update { id, name, subtitle, tags, clear_tags } => {
            let id = server_id(id)?;
            let mut record = registry.get(id).ok_or(PrmError::NotFound(id))?.record().clone();
            if let Some(name) = name {
                record.display_name = name;
            }
            if let Some(subtitle) = subtitle {
                record.subtitle = subtitle;
            }
            if clear_tags {
                record.tags.clear();
            } else if !tags.is_empty() {
                record.tags = tags;
            }
            registry.update_server(record, true)?;
        }
        Commands::Delete { id } => {
            let id = server_id(id)?;
            if !registry.delete_server(id)? {
                return Err(PrmError::NotFound(id));
            }
        }
        Commands::Tags => {
            for tag in registry.tags().iter() {
                let pin = if tag.pinned { "*" } else { " " };
                println!("{pin} {:<24} {}", tag.name, tag.count);
            }
        }
        Commands::Pin { tag } => {
            let pinned = registry.toggle_tag_pin(&tag)?;
            println!("{tag}: {}", if pinned { "pinned" } else { "unpinned" });
        }
        Commands::SelectTag { tag } => {
            registry.set_selected_tag(&tag);
            preferences.save()?;
        }
    }

    Ok(())
}

fn server_id(id: i64) -> Result<ServerId, PrmError> {
    let id = ServerId(id);
    if id.is_assigned() {
        Ok(id)
    } else {
        Err(PrmError::InvalidId(id.0))
    }
}

fn print_row(entry: &ServerEntry) {
    let record = entry.record();
    println!(
        "{:>4}  {:<7} {:<32} {}",
        record.id.0,
        record.protocol,
        record.title(),
        record.tags.join(",")
    );
}

fn print_details(entry: &ServerEntry) {
    let record = entry.record();
    println!("id:       {}", record.id);
    println!("name:     {}", record.display_name);
    if !record.subtitle.is_empty() {
        println!("subtitle: {}", record.subtitle);
    }
    println!("protocol: {}", record.protocol);
    if let SealedFields::Open(fields) = &record.fields {
        println!("address:  {}:{}", fields.address, fields.port);
        if let Some(user) = &fields.username {
            println!("user:     {user}");
        }
    }
    if !record.tags.is_empty() {
        println!("tags:     {}", record.tags.join(", "));
    }
}
