use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    async fn enroll(&self, user: &str, label: &str, descriptor_json: &str)
        -> zbus::Result<String>;
    async fn enroll_photo(&self, user: &str, label: &str, photo_url: &str)
        -> zbus::Result<String>;
    async fn verify(&self, user: &str) -> zbus::Result<()>;
    async fn retry(&self) -> zbus::Result<()>;
    async fn session(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_enrollments(&self, user: &str) -> zbus::Result<String>;
    async fn remove_enrollment(&self, user: &str, enrollment_id: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Client for the Presence attendance daemon")]
struct Cli {
    /// Connect to the session bus instead of the system bus.
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enroll a face descriptor from a JSON file (array of 128 floats).
    Enroll {
        user: String,
        /// Path to the descriptor JSON file.
        descriptor: std::path::PathBuf,
        #[arg(long, default_value = "default")]
        label: String,
    },
    /// Enroll a reference photo URL for the comparison service.
    EnrollPhoto {
        user: String,
        photo_url: String,
        #[arg(long, default_value = "default")]
        label: String,
    },
    /// Start a verification session for a user.
    Verify { user: String },
    /// Retry the active session after a liveness failure.
    Retry,
    /// Show the active session's progress.
    Session,
    /// Show daemon status.
    Status,
    /// List a user's enrollments.
    List { user: String },
    /// Remove an enrollment by ID.
    Remove { user: String, enrollment_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = if cli.session || std::env::var("PRESENCE_SESSION_BUS").is_ok() {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus (is presenced running?)")?;

    let proxy = PresenceProxy::new(&conn).await?;

    match cli.command {
        Command::Enroll {
            user,
            descriptor,
            label,
        } => {
            let json = std::fs::read_to_string(&descriptor)
                .with_context(|| format!("failed to read {}", descriptor.display()))?;
            // Validate locally so a malformed file fails with a readable error
            let values: Vec<f32> =
                serde_json::from_str(&json).context("descriptor file is not a JSON float array")?;
            let id = proxy
                .enroll(&user, &label, &serde_json::to_string(&values)?)
                .await?;
            println!("enrolled: {id}");
        }
        Command::EnrollPhoto {
            user,
            photo_url,
            label,
        } => {
            let id = proxy.enroll_photo(&user, &label, &photo_url).await?;
            println!("enrolled: {id}");
        }
        Command::Verify { user } => {
            proxy.verify(&user).await?;
            println!("session started; poll with `presence session`");
        }
        Command::Retry => {
            proxy.retry().await?;
            println!("retry requested");
        }
        Command::Session => {
            println!("{}", proxy.session().await?);
        }
        Command::Status => {
            println!("{}", proxy.status().await?);
        }
        Command::List { user } => {
            println!("{}", proxy.list_enrollments(&user).await?);
        }
        Command::Remove {
            user,
            enrollment_id,
        } => {
            if proxy.remove_enrollment(&user, &enrollment_id).await? {
                println!("removed {enrollment_id}");
            } else {
                println!("no enrollment {enrollment_id} for user {user}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
