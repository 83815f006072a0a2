use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_gateway_config_store::{ConfigStore, StoreError};

use crate::router::{build_router_with_state, shutdown_sessions, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", bin_name = "mcp-gateway", version)]
#[command(about = "Streaming gateway for stored MCP server configurations")]
#[command(arg_required_else_help = true)]
pub struct McpGatewayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Server(ServerArgs),
    /// Call the HTTP API without writing client code.
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path; defaults to the platform data directory.
    #[arg(long, short = 'd')]
    database: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Manage stored configurations.
    Configs(ConfigsArgs),
    /// Send a prompt to the live sessions of a configuration.
    Prompt(PromptArgs),
}

#[derive(Args, Debug)]
pub struct ConfigsArgs {
    #[command(subcommand)]
    command: ConfigsCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigsCommand {
    /// List all configurations.
    List(ClientArgs),
    /// Show one configuration.
    Get(ConfigIdArgs),
    /// Create a configuration from a JSON server spec.
    Create(ConfigCreateArgs),
    /// Replace a configuration's name and server spec.
    Update(ConfigUpdateArgs),
    /// Delete a configuration.
    Delete(ConfigIdArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct ConfigIdArgs {
    id: i64,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ConfigCreateArgs {
    #[arg(long, short = 'n')]
    name: String,

    /// JSON of the form `{"mcpServers": {"<name>": {"command": "...", "args": [...]}}}`.
    #[arg(long, short = 'c')]
    config: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ConfigUpdateArgs {
    id: i64,

    #[arg(long, short = 'n')]
    name: String,

    #[arg(long, short = 'c')]
    config: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct PromptArgs {
    config_id: i64,

    /// JSON prompt payload.
    #[arg(long, short = 'm')]
    prompt: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_gateway() -> Result<(), CliError> {
    let cli = McpGatewayCli::parse();
    init_logging();
    run_command(&cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Api(args) => run_api(&args.command),
    }
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let database = args.database.clone().unwrap_or_else(default_database_path);
    let addr = format!("{}:{}", args.host, args.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let store = ConfigStore::open(&database).await?;
        let state = Arc::new(AppState::new(store));
        let (router, state) = build_router_with_state(state);
        // The dashboard is served from another origin.
        let router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, database = %database.display(), "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("mcp-gateway").join("gateway.db"))
        .unwrap_or_else(|| PathBuf::from(".").join(".mcp-gateway").join("gateway.db"))
}

fn run_api(command: &ApiCommand) -> Result<(), CliError> {
    match command {
        ApiCommand::Configs(args) => run_configs(&args.command),
        ApiCommand::Prompt(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let prompt: Value = serde_json::from_str(&args.prompt)?;
            let response = ctx.post(
                &format!("/api/prompt/{}", args.config_id),
                &json!({ "prompt": prompt }),
            )?;
            print_json_response(response)
        }
    }
}

fn run_configs(command: &ConfigsCommand) -> Result<(), CliError> {
    match command {
        ConfigsCommand::List(args) => {
            let ctx = ClientContext::new(args)?;
            let response = ctx.get("/api/configs")?;
            print_json_response(response)
        }
        ConfigsCommand::Get(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let response = ctx.get(&format!("/api/configs/{}", args.id))?;
            print_json_response(response)
        }
        ConfigsCommand::Create(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let config: Value = serde_json::from_str(&args.config)?;
            let body = json!({ "name": args.name, "config": config });
            let response = ctx.post("/api/configs", &body)?;
            print_json_response(response)
        }
        ConfigsCommand::Update(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let config: Value = serde_json::from_str(&args.config)?;
            let body = json!({ "name": args.name, "config": config });
            let response = ctx.put(&format!("/api/configs/{}", args.id), &body)?;
            print_json_response(response)
        }
        ConfigsCommand::Delete(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let response = ctx.delete(&format!("/api/configs/{}", args.id))?;
            print_json_response(response)
        }
    }
}

struct ClientContext {
    endpoint: String,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path).send()?)
    }

    fn post(&self, path: &str, body: &Value) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }

    fn put(&self, path: &str, body: &Value) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::PUT, path).json(body).send()?)
    }

    fn delete(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::DELETE, path).send()?)
    }
}

fn print_json_response(response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: Value = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
