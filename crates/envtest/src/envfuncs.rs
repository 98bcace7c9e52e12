//! Ready-made global setup and finish funcs.
//!
//! These wrap simple, sequential I/O against the environment: picking a
//! working namespace, creating or deleting it with `kubectl`, and checking
//! that local port-forwards are up before anything else runs.
//!
//! ```rust,ignore
//! let namespace = envfuncs::random_name("e2e", 8);
//! registry
//!     .setup_named("require port-forwards", envfuncs::require_ports(vec![8080, 9090]))
//!     .setup_named("create namespace", envfuncs::create_namespace(namespace.clone()))
//!     .finish_named("delete namespace", envfuncs::delete_namespace(namespace));
//! ```

use crate::config::EnvConfig;
use crate::context::Context;
use crate::errors::FuncError;
use crate::funcs::{EnvFunc, FuncResult};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Context key under which namespace funcs store the namespace name.
pub const NAMESPACE_KEY: &str = "envtest.namespace";

/// Timeout for each port-forward connection check.
const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Build `prefix-<len random lowercase alphanumerics>`.
///
/// The result is a valid Kubernetes object name as long as `prefix` is.
#[must_use]
pub fn random_name(prefix: &str, len: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    if prefix.is_empty() {
        suffix
    } else {
        format!("{prefix}-{suffix}")
    }
}

/// Set the working namespace on the config and in the context.
pub fn set_namespace(name: impl Into<String>) -> impl EnvFunc {
    let name: String = name.into();
    move |ctx: Context, config: Arc<EnvConfig>| apply_namespace(ctx, config, name.clone())
}

/// Create namespace `name` with `kubectl` and make it the working namespace.
pub fn create_namespace(name: impl Into<String>) -> impl EnvFunc {
    let name: String = name.into();
    move |ctx: Context, config: Arc<EnvConfig>| {
        let name = name.clone();
        async move {
            kubectl(config.kubeconfig(), &["create", "namespace", name.as_str()]).await?;
            info!(target: "envtest.envfuncs", namespace = %name, "Namespace created");
            apply_namespace(ctx, config, name).await
        }
    }
}

/// Delete namespace `name` with `kubectl`, waiting for it to go away.
pub fn delete_namespace(name: impl Into<String>) -> impl EnvFunc {
    let name: String = name.into();
    move |ctx: Context, config: Arc<EnvConfig>| {
        let name = name.clone();
        async move {
            kubectl(
                config.kubeconfig(),
                &["delete", "namespace", name.as_str(), "--wait=true", "--ignore-not-found"],
            )
            .await?;
            info!(target: "envtest.envfuncs", namespace = %name, "Namespace deleted");
            FuncResult::Ok(ctx)
        }
    }
}

/// Fail unless every `port` on localhost accepts a TCP connection.
///
/// Intended as the first global setup when the environment is reached
/// through port-forwards, so a missing forward fails fast with a clear
/// message instead of as a connection error deep inside an assessment.
pub fn require_ports(ports: Vec<u16>) -> impl EnvFunc {
    move |ctx: Context, _config: Arc<EnvConfig>| check_ports(ctx, ports.clone())
}

async fn apply_namespace(ctx: Context, config: Arc<EnvConfig>, name: String) -> FuncResult {
    config.set_namespace(name.clone())?;
    Ok(ctx.with_value(NAMESPACE_KEY, name))
}

async fn check_ports(ctx: Context, ports: Vec<u16>) -> FuncResult {
    let unreachable = tokio::task::spawn_blocking(move || {
        ports
            .into_iter()
            .filter(|port| check_tcp_port(*port).is_err())
            .collect::<Vec<u16>>()
    })
    .await
    .map_err(|e| FuncError::failed(format!("Port check task failed: {e}")))?;

    if unreachable.is_empty() {
        return Ok(ctx);
    }
    warn!(target: "envtest.envfuncs", ports = ?unreachable, "Port-forwards not detected");
    Err(FuncError::failed(format!(
        "Port-forward not detected on localhost ports {unreachable:?}"
    )))
}

/// Check if a TCP port is reachable on localhost.
fn check_tcp_port(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PORT_CHECK_TIMEOUT).map(|_| ())
}

/// Run `kubectl` with `args`, failing with its stderr on non-zero exit.
async fn kubectl(kubeconfig: Option<&Path>, args: &[&str]) -> Result<(), FuncError> {
    let mut command = Command::new("kubectl");
    if let Some(path) = kubeconfig {
        command.arg("--kubeconfig").arg(path);
    }
    command.args(args).kill_on_drop(true);

    let output = command
        .output()
        .await
        .map_err(|e| FuncError::failed(format!("kubectl not available: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FuncError::failed(format!(
            "kubectl {} failed ({}): {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}
