//! Apicurio Registry Kubernetes Operator
//!
//! This operator manages ApicurioRegistry custom resources in Kubernetes,
//! deploying Apicurio Registry and keeping its Deployment, Service and
//! Ingress in line with the resource spec.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use registry_operator::capabilities::ClusterCapabilities;
use registry_operator::config::{
    parse_image_pull_policy, OperatorConfig, DEFAULT_OPERATOR_NAME, DEFAULT_REGISTRY_VERSION,
    IMAGE_PULL_POLICIES,
};
use registry_operator::controller;
use registry_operator::crd::ApicurioRegistry;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Apicurio Registry Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "registry-operator")]
#[command(about = "Kubernetes operator for Apicurio Registry deployments")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Value of the managed-by label on created resources
    #[arg(long, env = "OPERATOR_NAME", default_value = DEFAULT_OPERATOR_NAME)]
    operator_name: String,

    /// Registry version reported in resource labels
    #[arg(long, env = "REGISTRY_VERSION", default_value = DEFAULT_REGISTRY_VERSION)]
    registry_version: String,

    /// Default image for in-memory persistence
    #[arg(long, env = "REGISTRY_IMAGE_MEM")]
    image_mem: Option<String>,

    /// Default image for Kafka persistence
    #[arg(long, env = "REGISTRY_IMAGE_KAFKASQL")]
    image_kafkasql: Option<String>,

    /// Default image for SQL persistence
    #[arg(long, env = "REGISTRY_IMAGE_SQL")]
    image_sql: Option<String>,

    /// Pull policy of the registry container (Always, IfNotPresent, Never)
    #[arg(long, env = "REGISTRY_IMAGE_PULL_POLICY")]
    image_pull_policy: Option<String>,

    /// Seconds between reconciliations of a stable registry
    #[arg(long, env = "RESYNC_INTERVAL_SECONDS", default_value = "300")]
    resync_interval_seconds: u64,
}

impl Args {
    fn image_pull_policy(&self) -> Option<String> {
        let value = self.image_pull_policy.as_deref()?;
        let policy = parse_image_pull_policy(value);
        if policy.is_none() {
            warn!(
                value,
                allowed = ?IMAGE_PULL_POLICIES,
                "Ignoring invalid REGISTRY_IMAGE_PULL_POLICY"
            );
        }
        policy.map(String::from)
    }

    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            operator_name: self.operator_name.clone(),
            registry_version: self.registry_version.clone(),
            image_mem: self.image_mem.clone(),
            image_kafkasql: self.image_kafkasql.clone(),
            image_sql: self.image_sql.clone(),
            image_pull_policy: self.image_pull_policy(),
            resync_interval: Duration::from_secs(self.resync_interval_seconds),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        "Starting Apicurio Registry Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let capabilities = ClusterCapabilities::discover(&client)
        .await
        .context("Failed to discover cluster capabilities")?;

    // Empty string means cluster-wide
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace.clone())
    };

    controller::run_controller(client, namespace, args.operator_config(), capabilities)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = ApicurioRegistry::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["registry-operator"]);
        let config = args.operator_config();
        assert_eq!(config.operator_name, DEFAULT_OPERATOR_NAME);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert!(config.image_mem.is_none());
    }

    #[test]
    fn test_args_images() {
        let args = Args::parse_from([
            "registry-operator",
            "--image-sql",
            "apicurio/apicurio-registry-sql:2.6.x",
            "--namespace",
            "registries",
        ]);
        assert_eq!(args.namespace, "registries");
        assert_eq!(
            args.operator_config().image_sql.as_deref(),
            Some("apicurio/apicurio-registry-sql:2.6.x")
        );
    }
}
