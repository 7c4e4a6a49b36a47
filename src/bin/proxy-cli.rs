use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Management CLI for the forward proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "PROXY_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxy system status
    Status,
    /// List backends with health, circuit and pool state
    Backends,
    /// Show one backend
    Backend { id: String },
    /// Register a backend
    Add {
        id: String,
        address: String,
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },
    /// Deregister a backend
    Remove { id: String },
    /// Take a backend out of rotation
    Disable { id: String },
    /// Put a backend back into rotation
    Enable { id: String },
    /// Force a backend's circuit open
    OpenCircuit { id: String },
    /// Force a backend's circuit closed
    CloseCircuit { id: String },
    /// Show request metrics
    Metrics,
    /// Zero all request metrics
    ResetMetrics,
    /// Run a health check cycle now
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path, body) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string(), None),
        Commands::Backends => (Method::GET, "/admin/backends".to_string(), None),
        Commands::Backend { id } => (Method::GET, format!("/admin/backends/{id}"), None),
        Commands::Add { id, address, weight } => (
            Method::POST,
            "/admin/backends".to_string(),
            Some(json!({ "id": id, "address": address, "weight": weight })),
        ),
        Commands::Remove { id } => (Method::DELETE, format!("/admin/backends/{id}"), None),
        Commands::Disable { id } => (
            Method::PUT,
            format!("/admin/backends/{id}/active"),
            Some(json!({ "active": false })),
        ),
        Commands::Enable { id } => (
            Method::PUT,
            format!("/admin/backends/{id}/active"),
            Some(json!({ "active": true })),
        ),
        Commands::OpenCircuit { id } => (Method::POST, format!("/admin/backends/{id}/circuit/open"), None),
        Commands::CloseCircuit { id } => (Method::POST, format!("/admin/backends/{id}/circuit/close"), None),
        Commands::Metrics => (Method::GET, "/admin/metrics".to_string(), None),
        Commands::ResetMetrics => (Method::POST, "/admin/metrics/reset".to_string(), None),
        Commands::Check => (Method::POST, "/admin/health/check".to_string(), None),
    };

    let mut request = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }
    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
