use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Input, Password};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

use recon_session::auth::{LoginRequest, RegisterRequest, SessionController, SessionEvent};
use recon_session::config::{self, CliArgs, Command, Config, LogFormat};
use recon_session::http_client::ApiClient;
use recon_session::transport::ApiRequest;

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    let args = CliArgs::parse();

    let config = Config::from_args(&args)?;
    config.validate()?;

    init_logging(&config);

    tracing::debug!(
        base_url = %config.api_base_url,
        credentials_db = %config.credentials_db.display(),
        "Configuration loaded"
    );

    let client = ApiClient::from_config(&config)?;
    let controller = SessionController::new(client, Duration::from_secs(config.logout_timeout));
    let mut events = controller.events();

    let result = run(&controller, args.command).await;

    // Surface a forced logout that happened while serving the command
    loop {
        match events.try_recv() {
            Ok(SessionEvent::ForcedLogout { reason, .. }) => {
                eprintln!("Session expired ({}). Run `recon-session login` to sign in again.", reason);
                break;
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    result
}

/// Initialize logging; RUST_LOG overrides the configured level
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(controller: &SessionController, command: Command) -> Result<()> {
    match command {
        Command::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => Input::new()
                    .with_prompt("Email")
                    .interact_text()
                    .context("Failed to read email")?,
            };
            let password = Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?;

            let response = controller
                .login(&LoginRequest { email, password })
                .await?;
            println!("✅ Signed in as {}", response.user.username);
        }

        Command::Register {
            username,
            email,
            full_name,
            company_name,
        } => {
            let password = Password::new()
                .with_prompt("Password")
                .with_confirmation("Repeat password", "Passwords do not match")
                .interact()
                .context("Failed to read password")?;

            let response = controller
                .register(&RegisterRequest {
                    username,
                    email,
                    password,
                    full_name,
                    company_name,
                })
                .await?;
            println!("✅ Registered and signed in as {}", response.user.username);
        }

        Command::Logout => {
            controller.logout().await?;
            println!("👋 Signed out");
        }

        Command::Whoami => match controller.bootstrap()? {
            Some(verification) => {
                let verified = verification
                    .await
                    .context("Session verification task failed")?;
                if !verified {
                    anyhow::bail!("Stored session is no longer valid; please log in again");
                }
                let session = controller.session();
                println!("{}", serde_json::to_string_pretty(&session.user)?);
            }
            None => anyhow::bail!("Not signed in"),
        },

        Command::Status => {
            let stored = controller.client().store().snapshot()?;
            println!(
                "Signed in:     {}",
                if stored.access_token.is_some() { "yes" } else { "no" }
            );
            println!(
                "Refresh token: {}",
                if stored.refresh_token.is_some() { "present" } else { "absent" }
            );
            if let Some(user) = stored.user {
                println!("User:          {} <{}>", user.username, user.email);
            }
        }

        Command::ChangePassword => {
            let current = Password::new()
                .with_prompt("Current password")
                .interact()
                .context("Failed to read current password")?;
            let new = Password::new()
                .with_prompt("New password")
                .with_confirmation("Repeat new password", "Passwords do not match")
                .interact()
                .context("Failed to read new password")?;

            let message = controller.change_password(&current, &new).await?;
            println!("{}", message);
        }

        Command::Get { path } => {
            controller.set_location(Some(path.clone()));
            let response = controller.client().execute(ApiRequest::get(path)).await?;
            print_body(&response.text());
        }

        Command::Post { path, data } => {
            controller.set_location(Some(path.clone()));
            let body: serde_json::Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            let request = ApiRequest::post(path).json(&body)?;
            let response = controller.client().execute(request).await?;
            print_body(&response.text());
        }
    }

    Ok(())
}

/// Pretty-print JSON bodies, pass anything else through
fn print_body(body: &str) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => println!(
            "{}",
            serde_json::to_string_pretty(&json).unwrap_or_else(|_| body.to_string())
        ),
        Err(_) => println!("{}", body),
    }
}
