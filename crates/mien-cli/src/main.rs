use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;

/// How long to keep polling /status before giving up on the model.
const READY_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pose prompts for the three-photo enrollment session.
const POSES: [&str; 3] = ["front", "left", "right"];

#[derive(Parser)]
#[command(name = "mien", about = "mien face enrollment and recognition CLI")]
struct Cli {
    /// Base URL of the miend API.
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from one to three photos (front, left, right)
    Enroll {
        /// Label to store the embeddings under
        #[arg(short, long)]
        label: String,
        /// Enroll even if the face already matches an enrolled identity
        #[arg(long)]
        force: bool,
        /// Photo files, one per pose
        #[arg(num_args = 1..=3, required = true)]
        photos: Vec<PathBuf>,
    },
    /// Recognize the face in a photo
    Recognize {
        photo: PathBuf,
    },
    /// List enrolled labels
    List,
    /// Show daemon status
    Status,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    status: String,
    label: Option<String>,
    score: Option<f32>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordsReply {
    count: usize,
    labels: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let api = cli.api.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Enroll {
            label,
            force,
            photos,
        } => run_enroll(&client, &api, &label, force, &photos).await,
        Commands::Recognize { photo } => run_recognize(&client, &api, &photo).await,
        Commands::List => run_list(&client, &api).await,
        Commands::Status => run_status(&client, &api).await,
    }
}

/// Poll /status until the model is ready.
///
/// The daemon starts serving before the models finish loading, so early
/// requests would only get `model_not_ready` back; wait here instead.
async fn wait_for_model(client: &Client, api: &str) -> Result<()> {
    let started = Instant::now();
    loop {
        if let Ok(resp) = client.get(format!("{api}/status")).send().await {
            let reply: ApiReply = resp.json().await.context("parsing /status reply")?;
            match reply.status.as_str() {
                "ready" => return Ok(()),
                "error" => bail!(
                    "model failed to load: {}",
                    reply.message.unwrap_or_else(|| "unknown error".into())
                ),
                _ => {}
            }
        }
        if started.elapsed() >= READY_TIMEOUT {
            bail!("timed out waiting for the model to load");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// POST a photo as the multipart `file` part and decode the JSON reply.
async fn post_photo(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    photo: &Path,
) -> Result<ApiReply> {
    let bytes = tokio::fs::read(photo)
        .await
        .with_context(|| format!("reading {}", photo.display()))?;
    let file_name = photo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo".to_string());

    let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
    let form = reqwest::multipart::Form::new().part("file", part);

    let resp = client.post(url).query(query).multipart(form).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("API error {status}: {body}");
    }
    Ok(resp.json().await?)
}

async fn run_enroll(
    client: &Client,
    api: &str,
    label: &str,
    force: bool,
    photos: &[PathBuf],
) -> Result<()> {
    wait_for_model(client, api).await?;

    let total = photos.len();
    for (i, photo) in photos.iter().enumerate() {
        // Only the first photo of a session is subject to the duplicate
        // guard; once it passes, the remaining poses always append.
        let effective_force = if i == 0 { force } else { true };
        let query = [
            ("label", label.to_string()),
            ("force", effective_force.to_string()),
        ];

        let reply = post_photo(client, &format!("{api}/enroll"), &query, photo).await?;
        match reply.status.as_str() {
            "ok" => {
                let pose = POSES.get(i).copied().unwrap_or("extra");
                println!("photo {}/{total} enrolled ({pose}: {})", i + 1, photo.display());
            }
            "already_registered" => {
                let existing = reply.label.unwrap_or_default();
                let score = reply.score.unwrap_or_default();
                bail!(
                    "already enrolled as {existing} (score {score:.3}); \
                     re-run with --force to enroll anyway"
                );
            }
            "no_face" => bail!("no face detected in {}", photo.display()),
            "model_not_ready" => bail!("model is not ready; try again shortly"),
            other => bail!("unexpected API status: {other}"),
        }
    }

    println!("enrollment complete: {total} photo(s) under label {label}");
    Ok(())
}

async fn run_recognize(client: &Client, api: &str, photo: &Path) -> Result<()> {
    wait_for_model(client, api).await?;

    let reply = post_photo(client, &format!("{api}/recognize"), &[], photo).await?;
    match reply.status.as_str() {
        "ok" => {
            let label = reply.label.unwrap_or_default();
            let score = reply.score.unwrap_or_default();
            println!("{label} (score {score:.3})");
            Ok(())
        }
        "no_face" => bail!("no face detected in {}", photo.display()),
        "no_db" => bail!("no faces enrolled yet"),
        "model_not_ready" => bail!("model is not ready; try again shortly"),
        other => bail!("unexpected API status: {other}"),
    }
}

async fn run_list(client: &Client, api: &str) -> Result<()> {
    let reply: RecordsReply = client
        .get(format!("{api}/records"))
        .send()
        .await
        .context("connecting to miend")?
        .json()
        .await?;

    if reply.count == 0 {
        println!("no records enrolled");
    } else {
        println!("{} record(s):", reply.count);
        for label in reply.labels {
            println!("  {label}");
        }
    }
    Ok(())
}

async fn run_status(client: &Client, api: &str) -> Result<()> {
    let reply: ApiReply = client
        .get(format!("{api}/status"))
        .send()
        .await
        .context("connecting to miend")?
        .json()
        .await?;

    match reply.message {
        Some(message) => println!("{} ({message})", reply.status),
        None => println!("{}", reply.status),
    }
    Ok(())
}
