//! Colloquy CLI and REST API entry point.
//!
//! Binary name: `clqy`
//!
//! Parses CLI arguments, initializes the runtime state, then either starts
//! the REST/stream server or follows a stream from the terminal.

mod cli;
mod executors;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use colloquy_infra::stream::{StreamClient, StreamClientOptions, StreamKey};
use colloquy_types::event::wire::{Frame, WireFrame};
use colloquy_types::event::{StreamChunkData, StreamPayload};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state or tracing
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "clqy", &mut std::io::stdout());
        return Ok(());
    }

    let otel = matches!(cli.command, Commands::Serve { otel: true, .. });
    if otel {
        colloquy_observe::tracing_setup::init_tracing(true)
            .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;
    } else {
        let filter = match cli.verbose {
            0 if cli.quiet => "error",
            0 => "warn",
            1 => "info,colloquy=debug",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Serve { port, host, .. } => {
            let state = AppState::init().await?;

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} Colloquy API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            if otel {
                colloquy_observe::tracing_setup::shutdown_tracing();
            }
            println!("\n  Server stopped.");
        }

        Commands::Tail {
            session,
            operation,
            last_event_id,
            include_history,
            base_url,
        } => {
            let key = match (session, operation) {
                (Some(id), _) => StreamKey::Session(id),
                (None, Some(id)) => StreamKey::Operation(id),
                (None, None) => {
                    anyhow::bail!("pass --session <id> or --operation <id>");
                }
            };

            tail(&base_url, key, last_event_id, include_history).await;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Follow a stream, rendering deltas as they arrive.
async fn tail(base_url: &str, key: StreamKey, last_event_id: String, include_history: bool) {
    let client = StreamClient::new(base_url);
    let cancel = CancellationToken::new();
    let mut rx = client.connect(
        key,
        StreamClientOptions {
            last_event_id,
            include_history,
            ..Default::default()
        },
        cancel.clone(),
    );

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Wire(WireFrame::Connected { .. }) => {
                eprintln!("{}", console::style("connected").dim());
            }
            Frame::Wire(WireFrame::Heartbeat { .. }) => {}
            Frame::Wire(WireFrame::Error { error, phase, .. }) => {
                eprintln!(
                    "{} {error} ({})",
                    console::style("stream error:").red(),
                    phase.unwrap_or_default()
                );
            }
            Frame::Event(event) => match &event.payload {
                StreamPayload::StreamChunk { data } => match data {
                    StreamChunkData::Text { content } => {
                        print!("{content}");
                        use std::io::Write;
                        let _ = std::io::stdout().flush();
                    }
                    StreamChunkData::Reasoning { .. } => {}
                    StreamChunkData::ToolsCalling { tools_calling } => {
                        for call in tools_calling {
                            eprintln!(
                                "\n{} {}/{}",
                                console::style("tool call:").yellow(),
                                call.identifier,
                                call.api_name
                            );
                        }
                    }
                },
                StreamPayload::StreamEnd { .. } => println!(),
                StreamPayload::Error { data } => {
                    eprintln!("{} {}", console::style("error:").red(), data.error);
                }
                StreamPayload::AgentRuntimeEnd { data } => {
                    eprintln!(
                        "{} {}",
                        console::style("run finished:").green(),
                        data.status.clone().unwrap_or_else(|| "done".to_string())
                    );
                    break;
                }
                _ => {}
            },
        }
    }

    cancel.cancel();
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
