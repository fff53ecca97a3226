// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! llama-dds-client - Send chat-completion requests over DDS.
//!
//! ```bash
//! # One-shot completion
//! llama-dds-client "What is 2+2?"
//!
//! # Streaming, custom sampling
//! llama-dds-client --stream --max-tokens 100 --temperature 0.3 "Tell me a story"
//!
//! # Watch server heartbeats
//! llama-dds-client --status
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::*;
use llama_dds::{
    msg, util, ChatCompletionRequest, ChatCompletionResponse, DdsParams, DdsTransport,
    ServerStatus, TransportProfile,
};

/// Send chat-completion requests to a llama DDS server
#[derive(Parser, Debug)]
#[command(name = "llama-dds-client")]
#[command(version)]
#[command(about = "DDS client for llama chat completions")]
struct Args {
    /// Message to send (omit with --status)
    message: Option<String>,

    /// Shared DDS surface: --dds-domain, --dds-timeout, --parallel
    #[command(flatten)]
    dds: DdsParams,

    /// Model name to request (server default when empty)
    #[arg(short, long, default_value = "")]
    model: String,

    /// Optional system prompt prepended to the conversation
    #[arg(long)]
    system: Option<String>,

    /// Request a streaming session and print chunks as they arrive
    #[arg(short, long)]
    stream: bool,

    /// Maximum tokens to generate
    #[arg(long, default_value = "256")]
    max_tokens: i32,

    /// Sampling temperature
    #[arg(long, default_value = "0.7")]
    temperature: f32,

    /// Nucleus sampling threshold (0 < p < 1)
    #[arg(long)]
    top_p: Option<f32>,

    /// Stop sequence (repeatable)
    #[arg(long)]
    stop: Vec<String>,

    /// Seconds to wait for server discovery before giving up
    #[arg(long, default_value = "10")]
    discovery_timeout: u64,

    /// Watch server status heartbeats instead of sending a request
    #[arg(long)]
    status: bool,

    /// Print every sample as one JSON object per line
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Quiet mode - only the generated text
    #[arg(short, long)]
    quiet: bool,
}

enum Event {
    Response(ChatCompletionResponse),
    Status(ServerStatus),
}

fn main() {
    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }

    tracing_subscriber::fmt()
        .with_max_level(if args.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::WARN
        })
        .with_target(false)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let profile = TransportProfile::from_env()?;
    let transport = DdsTransport::new(args.dds.dds_domain, profile);

    let (tx, rx) = mpsc::channel::<Event>();
    let resp_tx = tx.clone();
    transport.start_client(
        move |resp| {
            let _ = resp_tx.send(Event::Response(resp));
        },
        move |status| {
            let _ = tx.send(Event::Status(status));
        },
    )?;

    let result = if args.status {
        watch_status(args, &rx, &running)
    } else {
        send_request(args, &transport, &rx, &running)
    };

    transport.stop_client();
    result
}

fn watch_status(
    args: &Args,
    rx: &mpsc::Receiver<Event>,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !args.quiet {
        eprintln!(
            "{} {} (domain={})",
            ">>>".green().bold(),
            "Watching server status".bold(),
            args.dds.dds_domain
        );
        eprintln!("{}", "Press Ctrl+C to stop".dimmed());
    }

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Event::Status(status)) => print_status(args, &status),
            Ok(Event::Response(_)) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn print_status(args: &Args, status: &ServerStatus) {
    if args.json {
        match serde_json::to_string(status) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("{}: {}", "Warning".yellow(), e),
        }
        return;
    }
    let ready = if status.ready {
        "ready".green()
    } else {
        "not ready".red()
    };
    println!(
        "{} {} model={} idle={} processing={}",
        status.server_id.cyan(),
        ready,
        status.model_loaded,
        status.slots_idle,
        status.slots_processing
    );
}

fn send_request(
    args: &Args,
    transport: &DdsTransport,
    rx: &mpsc::Receiver<Event>,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let message = args
        .message
        .as_deref()
        .ok_or("a message is required (or pass --status)")?;

    if !args.quiet {
        eprintln!("{} Waiting for server...", ">>>".green().bold());
    }
    transport.wait_for_server(Duration::from_secs(args.discovery_timeout))?;

    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(msg::ChatMessage::new(msg::ROLE_SYSTEM, system.clone()));
    }
    messages.push(msg::ChatMessage::new(msg::ROLE_USER, message));

    let request = ChatCompletionRequest {
        request_id: util::new_request_id(),
        model: args.model.clone(),
        messages,
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        stream: args.stream,
        top_p: args.top_p,
        n: None,
        stop: if args.stop.is_empty() {
            None
        } else {
            Some(args.stop.clone())
        },
    };

    if !args.quiet {
        eprintln!(
            "{} Request {} (stream={}, max_tokens={})",
            ">>>".green().bold(),
            request.request_id.cyan(),
            request.stream,
            request.max_tokens
        );
    }
    transport.send_request(&request)?;

    let deadline = Instant::now() + Duration::from_secs(args.dds.dds_timeout_secs);
    let mut printed_any = false;

    while running.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            return Err(format!(
                "no terminal response within {}s",
                args.dds.dds_timeout_secs
            )
            .into());
        }
        let response = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Event::Response(resp)) => resp,
            Ok(Event::Status(_)) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        // Durable history can replay other sessions; key by our id.
        if response.request_id != request.request_id {
            continue;
        }

        if args.json {
            println!("{}", serde_json::to_string(&response)?);
        } else if !response.content.is_empty() {
            print!("{}", response.content);
            use std::io::Write;
            let _ = std::io::stdout().flush();
            printed_any = true;
        }

        if response.is_final {
            if printed_any && !args.json {
                println!();
            }
            if !args.quiet {
                let reason = response.finish_reason.as_deref().unwrap_or("");
                let reason = match reason {
                    "error" => reason.red(),
                    _ => reason.green(),
                };
                eprintln!(
                    "{} finish={} prompt_tokens={} completion_tokens={}",
                    "---".dimmed(),
                    reason,
                    response.prompt_tokens,
                    response.completion_tokens
                );
            }
            return Ok(());
        }
    }

    Err("interrupted".into())
}
