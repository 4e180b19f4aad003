//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Smoke demos exercising the transport primitives end to end."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use parking_lot::Mutex;
use prometheus::{Encoder, Registry, TextEncoder};
use pt_common::{AppConfig, WorkerConfig};
use pt_msg::{Message, TransportMetricsExporter};
use pt_transport::{
    Publisher, RpcClient, RpcServer, RpcServerCallback, Session, Subscriber, SubscriberCallback,
};
use tracing::info;

use crate::config::read_config;

/// Dispatch entry point for demo subcommands.
pub fn run(command: DemoCommand) -> Result<()> {
    match command {
        DemoCommand::Pubsub(cmd) => cmd.execute(),
        DemoCommand::Rpc(cmd) => cmd.execute(),
    }
}

#[derive(Debug, Subcommand)]
pub enum DemoCommand {
    /// Publish messages and print what a subscriber receives.
    #[command(name = "pubsub")]
    Pubsub(PubsubCommand),
    /// Call an echo RPC server and print the reply.
    #[command(name = "rpc")]
    Rpc(RpcCommand),
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    /// Configuration file supplying session, worker, rpc and metrics settings.
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network name (a fresh in-memory one per run when neither this nor
    /// `--config` is given).
    #[arg(long = "network", value_name = "NAME")]
    network: Option<String>,

    /// Print Prometheus metrics gathered during the demo.
    #[arg(long = "metrics", action = clap::ArgAction::SetTrue)]
    metrics: bool,
}

/// Session plus the settings a demo runs with.
struct DemoContext {
    session: Session,
    registry: Option<Registry>,
    config: AppConfig,
}

impl SessionArgs {
    fn open(&self) -> Result<DemoContext> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?.config,
            None => {
                let mut config = AppConfig::default();
                config.session.network = format!("ptctl-{}", uuid::Uuid::new_v4());
                config
            }
        };
        if let Some(network) = &self.network {
            config.session.network = network.clone();
        }

        let session = Session::from_config(&config.session).context("failed to open session")?;
        let (session, registry) = if config.metrics.enabled {
            let registry = Registry::new();
            let exporter = TransportMetricsExporter::register(&registry)
                .context("failed to register metrics")?;
            (session.with_metrics(exporter), Some(registry))
        } else {
            (session, None)
        };
        info!(
            backend = %config.session.backend,
            network = %config.session.network,
            session = %session.id(),
            metrics = config.metrics.enabled,
            "demo session opened"
        );
        Ok(DemoContext {
            session,
            registry,
            config,
        })
    }

    fn dump_metrics(&self, registry: Option<&Registry>) -> Result<()> {
        if !self.metrics {
            return Ok(());
        }
        let Some(registry) = registry else {
            println!("metrics are disabled in the configuration");
            return Ok(());
        };
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        print!("{}", String::from_utf8_lossy(&buffer));
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct PubsubCommand {
    #[command(flatten)]
    session: SessionArgs,

    /// Topic to publish on.
    #[arg(long = "topic", default_value = "demo/pubsub")]
    topic: String,

    /// Topic the subscriber declares (may contain wildcards).
    #[arg(long = "subscribe", value_name = "KEY")]
    subscribe: Option<String>,

    /// Number of messages to publish.
    #[arg(long = "count", default_value_t = 3)]
    count: usize,

    /// Subscriber worker threads (defaults to `workers.thread_count`).
    #[arg(long = "threads")]
    threads: Option<usize>,

    /// Payload prefix; the message index is appended.
    #[arg(long = "payload", default_value = "hello")]
    payload: String,

    /// Attribute bytes sent with every message.
    #[arg(long = "attributes", default_value = "source=ptctl")]
    attributes: String,
}

impl PubsubCommand {
    pub fn execute(self) -> Result<()> {
        let DemoContext {
            session,
            registry,
            config,
        } = self.session.open()?;
        let workers = worker_config(&config, self.threads);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: SubscriberCallback = Arc::new(move |origin: &str, subscribed: &str, message: &Message| {
            let line = format!(
                "{origin} (via {subscribed}): payload={} attributes={}",
                String::from_utf8_lossy(message.payload()),
                String::from_utf8_lossy(message.attributes())
            );
            let _ = tx.lock().send(line);
        });

        let subscribe = self.subscribe.as_deref().unwrap_or(&self.topic);
        let subscriber = Subscriber::with_config(&session, subscribe, callback, &workers)?;
        let publisher = Publisher::declare(&session, &self.topic)?;
        for index in 0..self.count {
            let message = Message::new(
                format!("{}-{index}", self.payload).into_bytes(),
                self.attributes.clone().into_bytes(),
            );
            publisher.send(&message)?;
        }

        // Drains the queue before returning.
        subscriber.shutdown();
        let received: Vec<String> = rx.try_iter().collect();
        for line in &received {
            println!("{line}");
        }
        println!("received {}/{} message(s)", received.len(), self.count);
        self.session.dump_metrics(registry.as_ref())?;
        if received.len() != self.count {
            return Err(anyhow!(
                "subscriber on '{subscribe}' received {} of {} message(s)",
                received.len(),
                self.count
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct RpcCommand {
    #[command(flatten)]
    session: SessionArgs,

    /// Topic the echo server answers on.
    #[arg(long = "topic", default_value = "demo/echo")]
    topic: String,

    /// Request payload.
    #[arg(long = "payload", default_value = "ping")]
    payload: String,

    /// Call timeout in milliseconds (defaults to `rpc.timeout`).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Server worker threads (defaults to `workers.thread_count`).
    #[arg(long = "threads")]
    threads: Option<usize>,

    /// Skip declaring the server, so the call times out.
    #[arg(long = "no-server", action = clap::ArgAction::SetTrue)]
    no_server: bool,
}

impl RpcCommand {
    pub fn execute(self) -> Result<()> {
        let DemoContext {
            session,
            registry,
            config,
        } = self.session.open()?;
        let server = if self.no_server {
            None
        } else {
            let echo: RpcServerCallback = Arc::new(|_: &str, request: &Message| Some(request.clone()));
            let workers = worker_config(&config, self.threads);
            Some(RpcServer::with_config(&session, &self.topic, echo, &workers)?)
        };
        let timeout = self
            .timeout_ms
            .map_or(config.rpc.timeout, Duration::from_millis);

        let client = RpcClient::new(&session, &self.topic)?;
        let request = Message::new(self.payload.clone().into_bytes(), b"source=ptctl".to_vec());
        let result = client.call(&request, timeout);

        if let Some(server) = &server {
            server.shutdown();
        }
        self.session.dump_metrics(registry.as_ref())?;

        let reply = result.with_context(|| format!("call on '{}' failed", self.topic))?;
        println!(
            "reply from {}: payload={} attributes={}",
            reply.replier_topic,
            String::from_utf8_lossy(reply.message.payload()),
            String::from_utf8_lossy(reply.message.attributes())
        );
        Ok(())
    }
}

fn worker_config(config: &AppConfig, threads: Option<usize>) -> WorkerConfig {
    match threads {
        Some(threads) => config.workers.clone().with_thread_count(threads),
        None => config.workers.clone(),
    }
}
