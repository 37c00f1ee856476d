//! Maintenance commands over a token store file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::config::{load_config, StoreConfig};
use crate::credentials::{CredentialStore, TokenRecord, TokenSet, TokenStatus};

/// Inspect and maintain a session token store
#[derive(Parser, Debug)]
#[command(name = "credstore", version, about = "Session token store maintenance")]
pub struct Cli {
    /// TOML config file (`[store]` table)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overrides config and environment
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show token counts and contract ids
    Stats,
    /// List stored session ids
    Sessions,
    /// Show a session's token metadata (never the tokens themselves)
    Show { session: String },
    /// Save a token endpoint JSON response under a session id
    Import {
        session: String,
        /// JSON file with the token set
        file: PathBuf,
        /// Contract id to record
        #[arg(long)]
        contract: Option<String>,
    },
    /// Delete a session's token
    Delete { session: String },
    /// Delete every expired token
    PurgeExpired,
}

/// Token metadata safe to print.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub status: TokenStatus,
    pub token_type: String,
    pub scope: String,
    pub contract_id: String,
    pub has_refresh_token: bool,
    pub has_id_token: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionView {
    pub fn new(record: &TokenRecord, threshold_secs: i64) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status(threshold_secs),
            token_type: record.token_type.clone(),
            scope: record.scope.clone(),
            contract_id: record.contract_id.clone(),
            has_refresh_token: record.refresh_token.is_some(),
            has_id_token: record.id_token.is_some(),
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Resolves the store config: file, then env, then `--database`.
pub fn resolve_config(cli: &Cli) -> Result<StoreConfig> {
    let store = match &cli.config {
        Some(path) => load_config(path)?.store,
        None => StoreConfig::default(),
    };
    let mut store = store.apply_env();
    if let Some(database) = &cli.database {
        store.database_path = database.clone();
    }
    Ok(store)
}

/// Opens the store, runs one command, and closes the store again.
pub async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    info!(
        database_path = %config.database_path.display(),
        near_expiry_threshold_secs = config.near_expiry_threshold_secs,
        "Configuration loaded"
    );

    let store = CredentialStore::open(&config.database_path)
        .await
        .context("Failed to initialize token store")?;

    let result = execute(&store, cli.command, config.near_expiry_threshold_secs).await;
    store.close().await;
    result
}

pub async fn execute(
    store: &CredentialStore,
    command: Commands,
    threshold_secs: i64,
) -> Result<()> {
    match command {
        Commands::Stats => {
            let stats = store.stats().await?;
            print_json(&stats)?;
        }
        Commands::Sessions => {
            for id in store.list_sessions().await? {
                println!("{id}");
            }
        }
        Commands::Show { session } => match store.get(&session).await {
            Some(record) => print_json(&SessionView::new(&record, threshold_secs))?,
            None => anyhow::bail!("No token stored for session {session}"),
        },
        Commands::Import {
            session,
            file,
            contract,
        } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let token_set: TokenSet =
                serde_json::from_str(&contents).context("Failed to parse token set")?;
            store.save(&session, &token_set, contract.as_deref()).await?;
        }
        Commands::Delete { session } => store.delete(&session).await?,
        Commands::PurgeExpired => {
            let removed = store.purge_expired().await?;
            println!("{removed}");
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["credstore", "--database", "/tmp/t.db", "show", "sess-1"])
            .unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/t.db")));
        assert!(matches!(cli.command, Commands::Show { ref session } if session == "sess-1"));

        let cli = Cli::try_parse_from(["credstore", "purge-expired"]).unwrap();
        assert!(matches!(cli.command, Commands::PurgeExpired));
    }

    #[test]
    fn database_flag_overrides_config() {
        let cli =
            Cli::try_parse_from(["credstore", "--database", "/tmp/flag.db", "stats"]).unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/flag.db"));
    }

    #[tokio::test]
    async fn import_then_show_and_delete() {
        let store = CredentialStore::in_memory().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"access_token": "tok-A", "refresh_token": "ref-A", "expires_in": 3600}}"#
        )
        .unwrap();

        execute(
            &store,
            Commands::Import {
                session: "sess-1".to_string(),
                file: file.path().to_path_buf(),
                contract: Some("acme".to_string()),
            },
            300,
        )
        .await
        .unwrap();

        let record = store.get("sess-1").await.unwrap();
        let view = SessionView::new(&record, 300);
        assert_eq!(view.status, TokenStatus::Fresh);
        assert_eq!(view.contract_id, "acme");
        assert!(view.has_refresh_token);
        assert!(!serde_json::to_string(&view).unwrap().contains("tok-A"));

        execute(
            &store,
            Commands::Delete {
                session: "sess-1".to_string(),
            },
            300,
        )
        .await
        .unwrap();

        let missing = execute(
            &store,
            Commands::Show {
                session: "sess-1".to_string(),
            },
            300,
        )
        .await;
        assert!(missing.is_err());
    }
}
