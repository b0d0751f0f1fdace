//! Smoke client for the relay.
//!
//! Spawns the relay binary as a child process, drives it over stdio, lists
//! the advertised tools, optionally calls one, and dumps the built-in
//! downstream-server report.
//!
//! ```text
//! cargo run --example stdio_client -- --config-file relay.yaml
//! cargo run --example stdio_client -- --config-file relay.yaml \
//!     --call read_file --args '{"path": "/tmp/demo.txt"}'
//! ```

use std::borrow::Cow;

use clap::Parser;
use rmcp::{
    model::CallToolRequestParam,
    transport::{ConfigureCommandExt, TokioChildProcess},
    ServiceExt,
};
use tracing::info;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(Parser)]
#[command(name = "stdio_client")]
#[command(about = "Drive a relay instance over stdio and print what it advertises")]
struct Cli {
    /// Relay binary to spawn (resolved via PATH unless absolute)
    #[arg(long, default_value = "mcp-scan-relay")]
    relay_bin: String,

    /// Configuration file handed to the relay
    #[arg(long)]
    config_file: String,

    /// Tool to call after listing, by its advertised name
    #[arg(long)]
    call: Option<String>,

    /// JSON object with arguments for --call
    #[arg(long, default_value = "{}")]
    args: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let transport = TokioChildProcess::new(tokio::process::Command::new(&cli.relay_bin).configure(
        |cmd| {
            cmd.arg(format!("--config-file={}", cli.config_file))
                .stderr(std::process::Stdio::inherit());
        },
    ))?;
    let client = ().serve(transport).await?;
    info!("relay session established");

    let tools = client.peer().list_all_tools().await?;
    println!("== {} tools advertised ==", tools.len());
    for tool in &tools {
        println!(
            "  {:<40} {}",
            tool.name,
            tool.description.as_deref().unwrap_or("")
        );
    }

    if let Some(tool_name) = &cli.call {
        let arguments = match serde_json::from_str(&cli.args)? {
            serde_json::Value::Object(map) => Some(map),
            _ => return Err("--args must be a JSON object".into()),
        };
        let result = client
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(tool_name.clone()),
                arguments,
            })
            .await?;
        println!("== {} result (is_error: {:?}) ==", tool_name, result.is_error);
        for content in &result.content {
            if let Some(text) = content.as_text() {
                println!("{}", text.text);
            }
        }
    }

    let report = client
        .call_tool(CallToolRequestParam {
            name: Cow::Borrowed("list_downstream_servers_info"),
            arguments: None,
        })
        .await?;
    println!("== downstream servers ==");
    for content in &report.content {
        if let Some(text) = content.as_text() {
            println!("{}", text.text);
        }
    }

    client.cancel().await?;
    Ok(())
}
