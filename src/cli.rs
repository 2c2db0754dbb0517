use crate::auth;
use crate::client::ApiClient;
use crate::config::Settings;
use crate::credentials::CredentialStore;
use crate::server;
use crate::tools::{login_summary, Dispatcher};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "quarri-mcp", version, about = "MCP server and login helper for Quarri")]
pub struct Cli {
    /// Backend base URL
    #[arg(long, global = true, env = "QUARRI_API_URL")]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve MCP over stdin/stdout (default)
    Serve,
    /// Email a verification code
    Login {
        #[arg(long)]
        email: String,
    },
    /// Finish login with the emailed code
    Verify {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: String,
    },
    /// Redeem a team invite
    Invite {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: String,
    },
    /// Start a new account
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    /// Finish signup with the emailed code
    CompleteSignup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: String,
    },
    /// Show the stored session
    Status {
        /// Also check the token with the backend
        #[arg(long)]
        remote: bool,
    },
    /// Remove the stored session
    Logout,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::from_env();
        if let Some(url) = &self.api_url {
            settings = Settings::new(url.clone(), settings.credentials_path);
        }
        settings
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings();
    let store = CredentialStore::new(settings.credentials_path.clone());
    let client = ApiClient::new(&settings)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!("quarri-mcp server starting (backend {})", settings.base_url);
            tokio::spawn(server::probe_health(client.clone()));
            let dispatcher = Dispatcher::new(store, client);
            let reader = BufReader::new(tokio::io::stdin());
            server::run(reader, tokio::io::stdout(), &dispatcher).await
        }

        Command::Login { email } => {
            auth::request_code(&client, &email).await?;
            println!("Verification code sent to {email}.");
            println!("Run: quarri-mcp verify --email {email} --code <code>");
            Ok(())
        }

        Command::Verify { email, code } => {
            let creds = auth::verify_code(&client, &store, &email, &code).await?;
            println!("{}", login_summary(&creds));
            Ok(())
        }

        Command::Invite { email, code } => {
            let creds = auth::verify_invite(&client, &store, &email, &code).await?;
            println!("{}", login_summary(&creds));
            Ok(())
        }

        Command::Signup { email, name, company } => {
            auth::initiate_signup(&client, &email, name.as_deref(), company.as_deref()).await?;
            println!("Signup started. A verification code was sent to {email}.");
            println!("Run: quarri-mcp complete-signup --email {email} --code <code>");
            Ok(())
        }

        Command::CompleteSignup { email, code } => {
            let creds = auth::complete_signup(&client, &store, &email, &code).await?;
            println!("{}", login_summary(&creds));
            Ok(())
        }

        Command::Status { remote } => {
            let Some(creds) = store.load() else {
                match store.stored_email() {
                    Some(email) => bail!("Session for {email} expired. Run: quarri-mcp login --email {email}"),
                    None => bail!("Not logged in. Run: quarri-mcp login --email <email>"),
                }
            };
            println!("{}", login_summary(&creds));
            println!("Expires: {}", creds.expires_at.to_rfc3339());
            if remote {
                auth::validate_token(&client, &creds.token).await?;
                println!("Token accepted by {}", settings.base_url);
            }
            Ok(())
        }

        Command::Logout => {
            store.clear()?;
            println!("Logged out.");
            Ok(())
        }
    }
}
