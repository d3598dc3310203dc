use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::token::{HmacVerifier, TokenDecoder};
use rollcall_core::ScanOutcome;

// `#[zbus::proxy]` generates both `AttendanceProxy` (async) and
// `AttendanceProxyBlocking`; only the async variant is used here.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn submit_scan(&self, text: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_results(&self) -> zbus::Result<String>;
    async fn outbox_list(&self, state: &str, limit: u32) -> zbus::Result<String>;
    async fn outbox_retry(&self, record_id: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance daemon CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Submit raw scan text (as the UI scanner would)
    Scan {
        /// Token payload, JSON or pipe-separated
        text: String,
    },
    /// Show recent verification results
    Results,
    /// Inspect the outbox journal
    Outbox {
        /// Filter: pending, committed, failed, or all
        #[arg(short, long, default_value = "all")]
        state: String,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Reset a failed outbox entry to pending
    Retry {
        /// Record ID to retry
        id: String,
    },
    /// Decode a token payload locally without the daemon
    Inspect {
        /// Token payload, JSON or pipe-separated
        text: String,
        /// HMAC key to check the signature against
        #[arg(short, long)]
        key: Option<String>,
    },
    /// List capture devices
    Probe,
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::system()
        .await
        .context("failed to connect to system bus (is rollcalld running?)")?;
    AttendanceProxy::new(&conn)
        .await
        .context("failed to create daemon proxy")
}

/// Pretty-print a JSON reply, falling back to the raw string.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}

/// Decoder with a no-op signature check, for structure-only inspection.
struct AcceptAll;

impl rollcall_core::SignatureVerifier for AcceptAll {
    fn verify(&self, _canonical: &str, _signature_hex: &str) -> bool {
        true
    }
}

fn inspect(text: &str, key: Option<&str>) {
    let decoder = match key {
        Some(k) => TokenDecoder::new(Box::new(HmacVerifier::new(k.as_bytes()))),
        None => TokenDecoder::new(Box::new(AcceptAll)),
    };
    match decoder.decode(text) {
        ScanOutcome::Token(token) => {
            println!("session:  {}", token.session_id);
            println!("issued:   {} ms", token.issued_at_ms);
            println!("expires:  {} ms", token.expires_at_ms);
            match key {
                Some(_) => println!("signature: valid"),
                None => println!("signature: not checked (no --key)"),
            }
        }
        ScanOutcome::BadSignature(token) => {
            println!("session:  {}", token.session_id);
            println!("signature: INVALID");
        }
        ScanOutcome::Malformed { reason } => println!("malformed: {reason}"),
        ScanOutcome::NotFound => println!("no token payload found"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let status = proxy().await?.status().await?;
            print_json(&status);
        }
        Commands::Scan { text } => {
            let accepted = proxy().await?.submit_scan(&text).await?;
            if accepted {
                println!("scan accepted");
            } else {
                println!("scan rejected (malformed or bad signature)");
                std::process::exit(1);
            }
        }
        Commands::Results => {
            let results = proxy().await?.recent_results().await?;
            print_json(&results);
        }
        Commands::Outbox { state, limit } => {
            let entries = proxy().await?.outbox_list(&state, limit).await?;
            print_json(&entries);
        }
        Commands::Retry { id } => {
            if proxy().await?.outbox_retry(&id).await? {
                println!("entry {id} reset to pending");
            } else {
                println!("entry {id} not found or not failed");
                std::process::exit(1);
            }
        }
        Commands::Inspect { text, key } => {
            inspect(&text, key.as_deref());
        }
        Commands::Probe => {
            let devices = rollcall_hw::CameraSource::list_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            } else {
                for dev in devices {
                    println!("{}  {} ({})", dev.path, dev.name, dev.driver);
                }
            }
        }
    }

    Ok(())
}
