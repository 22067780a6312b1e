use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kestrel_engine::{Context, EngineConfig, Runtime};
use kestrel_kinds::{logshipper, remoterole, LogShipper, RemoteRole};
use kestrel_kubehub::{KubeCluster, KubeEventRecorder};
use kestrel_status::{PrometheusSink, StatusTracker};
use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Resource;
use tracing::{error, info, warn};

const CONTROLLER: &str = "kestrel-controller";

#[derive(Parser, Debug)]
#[command(name = "kestrelctl", version, about = "Kestrel operator")]
struct Cli {
    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the LogShipper controller until SIGINT/SIGTERM
    Run {
        /// Concurrent reconciles; overrides KESTREL_WORKERS
        #[arg(long)]
        workers: Option<u16>,
        /// Prometheus exporter listen address, host:port
        #[arg(long = "metrics-addr", env = "KESTREL_METRICS_ADDR")]
        metrics_addr: Option<String>,
    },
    /// Print the CRDs of every managed kind as YAML
    Crds,
    /// Check that the API server serves every kind the controller needs
    Preflight {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
    /// Answer a RemoteRole AdmissionReview read from a file ("-" for stdin)
    Admit { file: PathBuf },
}

fn init_tracing() {
    let env = std::env::var("KESTREL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<String>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid metrics address; expected host:port");
        }
    }
}

fn required_kinds() -> Vec<GroupVersionKind> {
    let gvk_of = |ar: ApiResource| GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
    let mut kinds = vec![
        gvk_of(ApiResource::erase::<LogShipper>(&())),
        gvk_of(ApiResource::erase::<RemoteRole>(&())),
        gvk_of(ApiResource::erase::<Secret>(&())),
    ];
    kinds.extend(logshipper::owned_kinds().into_iter().map(gvk_of));
    kinds
}

async fn run(namespace: Option<String>, workers: Option<u16>, metrics_addr: Option<String>) -> Result<()> {
    init_metrics(metrics_addr);
    let client = kestrel_kubehub::get_kube_client().await?;
    let mut config = EngineConfig::from_env();
    if let Some(w) = workers.filter(|w| *w > 0) {
        config.workers = w;
    }
    info!(ns = ?namespace, workers = config.workers, finalizer = %config.finalizer, "starting kestrel");

    let cluster = Arc::new(KubeCluster::new(client.clone(), config.field_manager.clone()));
    let recorder = Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER));
    let tracker = StatusTracker::new(recorder, Arc::new(PrometheusSink));
    let ctx = Context::new(cluster, tracker, config);

    let mut runtime = Runtime::new(logshipper::pipeline(), ctx)
        .namespace(namespace)
        .index(Arc::new(logshipper::index()))
        .watches(ApiResource::erase::<Secret>(&()), logshipper::SECRET_INDEX);
    for ar in logshipper::owned_kinds() {
        runtime = runtime.owns(ar);
    }
    runtime.run(client).await;
    Ok(())
}

async fn preflight(output: Output) -> Result<bool> {
    let client = kestrel_kubehub::get_kube_client().await?;
    let groups = [LogShipper::group(&()).into_owned(), Deployment::group(&()).into_owned(), String::new()];
    let groups: Vec<&str> = groups.iter().map(String::as_str).collect();
    let served = kestrel_kubehub::discover(client, &groups).await?;
    let missing = kestrel_kubehub::missing_kinds(&served, &required_kinds());
    match output {
        Output::Human => {
            if missing.is_empty() {
                println!("all {} required kinds are served", required_kinds().len());
            }
            for key in &missing {
                println!("missing • {}", key);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&missing)?),
    }
    Ok(missing.is_empty())
}

async fn admit(file: PathBuf) -> Result<()> {
    let raw = if file.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading stdin")?
    } else {
        std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?
    };
    let review: AdmissionReview<RemoteRole> = serde_json::from_str(&raw).context("parsing AdmissionReview")?;
    let req: AdmissionRequest<RemoteRole> = review.try_into().context("AdmissionReview without request")?;

    // uniqueness is checked against what the cluster holds right now
    let client = kestrel_kubehub::get_kube_client().await?;
    let index = Arc::new(remoterole::index());
    for role in Api::<RemoteRole>::all(client).list(&ListParams::default()).await.context("listing RemoteRoles")? {
        index.upsert(&role);
    }
    let res = kestrel_webhook::review(&req, &remoterole::validator(index));
    println!("{}", serde_json::to_string_pretty(&res.into_review())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, metrics_addr } => run(cli.namespace, workers, metrics_addr).await?,
        Commands::Crds => {
            for crd in kestrel_kinds::crds() {
                println!("---\n{}", serde_yaml::to_string(&crd)?);
            }
        }
        Commands::Preflight { output } => match preflight(output).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                error!(error = ?e, "preflight failed");
                return Err(e);
            }
        },
        Commands::Admit { file } => admit(file).await?,
    }
    Ok(())
}
