use std::{io::Read, str::FromStr};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ctrlkit_api::ControllerClient;
use ctrlkit_apply::{decode_manifests, prepare_apply, prune, ApplyPart};
use ctrlkit_core::{gvk_of, Scope, Settings};
use ctrlkit_kubehub::Binding;
use ctrlkit_predicates::{has_label, EventGate};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{core::DynamicObject, Api};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod guard;

#[derive(Parser, Debug)]
#[command(name = "ctrlkitctl", version, about = "ctrlkit CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for documents that omit one (namespaced kinds only)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs) and print their mappings
    Discover,
    /// Print the endpoint each manifest document resolves to
    Resolve {
        /// YAML file, or "-" for stdin
        file: String,
    },
    /// Print the apply patch for each manifest document (offline)
    Patch {
        /// YAML file, or "-" for stdin
        file: String,
        /// Build a status patch instead of a spec patch
        #[arg(long = "status", action = ArgAction::SetTrue)]
        status: bool,
        /// Prune nulls and emptied maps even for schemaless documents
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Server-side apply every manifest document
    Apply {
        /// YAML file, or "-" for stdin
        file: String,
        /// Apply the status subresource
        #[arg(long = "status", action = ArgAction::SetTrue)]
        status: bool,
        /// Field manager (default: CTRLKIT_FIELD_MANAGER or "ctrlkit")
        #[arg(long = "field-manager")]
        field_manager: Option<String>,
        /// Take ownership of conflicting fields
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Keep a finalizer on ConfigMaps and release it when they are deleted
    Guard {
        /// Finalizer to manage, e.g. "example.io/guard"
        #[arg(long = "finalizer")]
        finalizer: String,
        /// Only guard ConfigMaps carrying this label
        #[arg(long = "label")]
        label: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("CTRLKIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CTRLKIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CTRLKIT_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_source(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
}

fn doc_label(doc: &DynamicObject) -> String {
    let kind = doc.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("?");
    let name = doc.metadata.name.as_deref().unwrap_or("?");
    match doc.metadata.namespace.as_deref() {
        Some(ns) => format!("{}/{}/{}", kind, ns, name),
        None => format!("{}/{}", kind, name),
    }
}

/// Fill in `--ns` for documents of namespaced kinds that omit a namespace.
async fn default_namespace(cc: &ControllerClient, doc: &mut DynamicObject, ns: Option<&str>, cancel: &CancellationToken) -> Result<()> {
    let Some(ns) = ns else { return Ok(()) };
    if doc.metadata.namespace.as_deref().is_some_and(|n| !n.is_empty()) {
        return Ok(());
    }
    let gvk = gvk_of(doc.types.as_ref())?;
    if cc.router().cache().lookup(&gvk, cancel).await?.scope == Scope::Namespaced {
        doc.metadata.namespace = Some(ns.to_string());
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let cc = ControllerClient::try_default(settings).await.context("connecting to cluster")?;
            let table = cc.router().cache().refresh(&cancel).await.context("discovery failed")?;
            match cli.output {
                Output::Human => {
                    for m in table.sorted() {
                        let scope = match m.scope { Scope::Namespaced => "namespaced", Scope::Cluster => "cluster" };
                        println!("{} • {} • {} • {}", m.api_version(), m.kind, m.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&table.sorted())?),
            }
        }
        Commands::Resolve { file } => {
            let yaml = read_source(&file)?;
            let docs = decode_manifests(&yaml, settings.max_yaml_bytes).context("decoding manifests")?;
            info!(docs = docs.len(), "resolve invoked");
            let cc = ControllerClient::try_default(settings).await.context("connecting to cluster")?;
            #[derive(serde::Serialize)]
            struct Row { object: String, resource: String, namespace: Option<String> }
            let mut rows = Vec::with_capacity(docs.len());
            for mut doc in docs {
                default_namespace(&cc, &mut doc, cli.namespace.as_deref(), &cancel).await?;
                let target = cc.router().route(&doc, &cancel).await.with_context(|| format!("resolving {}", doc_label(&doc)))?;
                let resource = if target.resource.group.is_empty() {
                    format!("{}/{}", target.resource.version, target.resource.plural)
                } else {
                    format!("{}/{}/{}", target.resource.group, target.resource.version, target.resource.plural)
                };
                let namespace = match target.binding {
                    Binding::Namespaced(ns) => Some(ns),
                    Binding::Cluster => None,
                };
                rows.push(Row { object: doc_label(&doc), resource, namespace });
            }
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        println!("{} -> {} ({})", r.object, r.resource, r.namespace.as_deref().unwrap_or("cluster"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Patch { file, status, prune: force_prune } => {
            let yaml = read_source(&file)?;
            let docs = decode_manifests(&yaml, settings.max_yaml_bytes).context("decoding manifests")?;
            let part = if status { ApplyPart::Status } else { ApplyPart::Spec };
            let mut patches = Vec::with_capacity(docs.len());
            for doc in &docs {
                let mut patch = prepare_apply(doc, part).with_context(|| format!("building patch for {}", doc_label(doc)))?;
                if force_prune {
                    prune(&mut patch);
                }
                patches.push(patch);
            }
            match cli.output {
                Output::Human => {
                    for p in &patches {
                        print!("---\n{}", serde_yaml::to_string(p)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&patches)?),
            }
        }
        Commands::Apply { file, status, field_manager, force } => {
            let yaml = read_source(&file)?;
            let docs = decode_manifests(&yaml, settings.max_yaml_bytes).context("decoding manifests")?;
            let field_manager = field_manager.unwrap_or_else(|| settings.field_manager.clone());
            let force = force || settings.force_apply;
            info!(docs = docs.len(), field_manager = %field_manager, force, status, "apply invoked");
            let cc = ControllerClient::try_default(settings)
                .await
                .context("connecting to cluster")?
                .with_apply_options(field_manager, force);
            for mut doc in docs {
                default_namespace(&cc, &mut doc, cli.namespace.as_deref(), &cancel).await?;
                let label = doc_label(&doc);
                let res = if status { cc.apply_status(&doc, &cancel).await } else { cc.apply(&doc, &cancel).await };
                match res {
                    Ok(applied) => match cli.output {
                        Output::Human => println!(
                            "applied {} (rv {})",
                            label,
                            applied.metadata.resource_version.as_deref().unwrap_or("-")
                        ),
                        Output::Json => println!("{}", serde_json::to_string(&applied)?),
                    },
                    Err(e) => {
                        warn!(object = %label, error = %e, "apply failed");
                        return Err(e).with_context(|| format!("applying {}", label));
                    }
                }
            }
        }
        Commands::Guard { finalizer, label } => {
            let ns = cli.namespace.as_deref();
            info!(finalizer = %finalizer, ns = ?ns, label = ?label, "guard invoked");
            let cc = ControllerClient::try_default(settings).await.context("connecting to cluster")?;
            let api: Api<ConfigMap> = match ns {
                Some(ns) => Api::namespaced(cc.kube().clone(), ns),
                None => Api::all(cc.kube().clone()),
            };
            let engine = cc.engine::<ConfigMap, _>(finalizer, guard::Guard::default());
            let gate = label.map(|l| EventGate::new(has_label::<ConfigMap>(l)));
            cc.run(api, engine, gate, cancel.clone()).await;
            warn!("guard loop ended (graceful shutdown)");
        }
    }

    Ok(())
}
