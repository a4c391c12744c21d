use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nostr_bus::{
    merge_profiles, parse_public_key, parse_relays, BusCallbacks, BusConfig, BusHandle,
    DirectMessage, Error, MessageHandler, NostrBus, ProfileContent, ReplyHandle,
};

#[derive(Debug, Parser)]
#[command(name = "nostr-bus")]
#[command(about = "Run the Nostr DM bus or manage the account profile")]
struct Cli {
    /// Relay URL (repeatable). Falls back to NOSTR_RELAYS.
    #[arg(long, global = true)]
    relay: Vec<String>,
    /// Secret key (hex or nsec). Falls back to NOSTR_SECRET_KEY.
    #[arg(long, global = true)]
    key: Option<String>,
    #[arg(long, global = true)]
    account: Option<String>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for DMs and echo each one back to its sender.
    Listen,
    /// Publish a kind-0 profile to every relay.
    PublishProfile(ProfileArgs),
    /// Fetch the newest profile for a pubkey.
    ImportProfile {
        /// Author pubkey (hex or npub). Defaults to our own key.
        #[arg(long)]
        pubkey: Option<String>,
        /// Merge into this local profile JSON and print the result.
        #[arg(long)]
        merge_with: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct ProfileArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    about: Option<String>,
    #[arg(long)]
    picture: Option<String>,
    #[arg(long)]
    banner: Option<String>,
    #[arg(long)]
    website: Option<String>,
    #[arg(long)]
    nip05: Option<String>,
    #[arg(long)]
    lud16: Option<String>,
}

impl From<ProfileArgs> for ProfileContent {
    fn from(args: ProfileArgs) -> Self {
        ProfileContent {
            name: args.name,
            display_name: args.display_name,
            about: args.about,
            picture: args.picture,
            banner: args.banner,
            website: args.website,
            nip05: args.nip05,
            lud16: args.lud16,
        }
    }
}

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn on_message(&self, message: DirectMessage, reply: ReplyHandle) -> Result<(), Error> {
        info!(event_id = %message.event_id, sender = %message.sender, "Received DM");
        let receipt = reply.send(&message.plaintext).await?;
        info!(event_id = %receipt.event_id, relay = %receipt.relay, "Echoed DM");
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<BusConfig, Error> {
    let env_config = BusConfig::from_env().ok().flatten();

    let relays = if cli.relay.is_empty() {
        env_config
            .as_ref()
            .map(|c| c.relays.clone())
            .unwrap_or_default()
    } else {
        cli.relay.iter().flat_map(|r| parse_relays(r)).collect()
    };
    let secret_key = cli
        .key
        .clone()
        .or_else(|| env_config.as_ref().map(|c| c.secret_key.clone()))
        .or_else(|| std::env::var("NOSTR_SECRET_KEY").ok())
        .ok_or(Error::MissingEnv("NOSTR_SECRET_KEY"))?;

    let mut config = match env_config {
        Some(mut config) => {
            config.relays = relays;
            config.secret_key = secret_key;
            config
        }
        None => BusConfig::new(secret_key, relays),
    };
    if let Some(account) = &cli.account {
        config.account_id = account.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let callbacks = BusCallbacks {
        on_error: Some(Arc::new(|err: &Error, context: &str| {
            warn!(context, error = %err, "Bus reported error");
        })),
        on_eose: Some(Arc::new(|relay: &str| {
            info!(relay, "Caught up with stored events");
        })),
        on_metric: None,
    };

    let bus = NostrBus::start(config, Arc::new(Echo), callbacks).await?;
    info!(pubkey = %bus.public_key(), account = bus.account_id(), "Bus ready");

    let outcome = run(&bus, cli.command).await;
    bus.close().await?;
    outcome
}

async fn run(bus: &BusHandle, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Listen => {
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
        Command::PublishProfile(args) => {
            let result = bus.publish_profile(&ProfileContent::from(args)).await?;
            println!("{}", serde_json::to_string_pretty(&bus.get_profile_state())?);
            if !result.any_success() {
                return Err(format!("no relay accepted profile {}", result.event_id).into());
            }
        }
        Command::ImportProfile { pubkey, merge_with } => {
            let author = match pubkey {
                Some(value) => parse_public_key(&value)?,
                None => bus.public_key(),
            };
            let imported = bus.import_profile(&author).await?;
            info!(
                event_id = %imported.event_id,
                relay = %imported.source_relay,
                created_at = imported.created_at,
                queried = imported.relays_queried,
                "Imported profile"
            );
            let profile = match merge_with {
                Some(path) => {
                    let local = ProfileContent::from_json(&std::fs::read_to_string(path)?)?;
                    merge_profiles(&local, &imported.profile)
                }
                None => imported.profile,
            };
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
    }
    Ok(())
}
