//! Cross-substrate port forwarding: a single handle type
//! over an SSH [`Tunnel`](crate::adapter::ssh::Tunnel) or a Kubernetes
//! [`K8sPortForward`](crate::adapter::k8s::K8sPortForward), so the CLI's
//! `forward` command doesn't need to match on substrate after setup.

use crate::adapter::k8s::K8sPortForward;
use crate::adapter::ssh::pool::SshPool;
use crate::adapter::ssh::Tunnel;
use crate::adapter::Target;
use crate::errors::{XecError, XecResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// One endpoint of a `forward` invocation, parsed from the CLI's
/// `host:port` / `pod:name:port` / bare-port shapes.
#[derive(Debug, Clone)]
pub enum ForwardEndpoint {
    /// A bare local port, meaning "this machine".
    LocalPort(u16),
    /// `host:port` against a named SSH target.
    Remote { target_token: String, port: u16 },
    /// `pod:name:port` against a named Kubernetes pod.
    Pod { pod_token: String, port: u16 },
}

/// Parse one forward endpoint string.
///
/// Accepts a bare port (`8080`), `host:port`, or `pod:<name>:<port>`.
///
/// # Errors
/// Returns `XecError::ConfigInvalid` if the string matches none of the
/// accepted shapes or the port segment does not parse as `u16`.
pub fn parse_endpoint(spec: &str) -> XecResult<ForwardEndpoint> {
    if let Ok(port) = spec.parse::<u16>() {
        return Ok(ForwardEndpoint::LocalPort(port));
    }
    if let Some(rest) = spec.strip_prefix("pod:") {
        let (name, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| XecError::ConfigInvalid(format!("invalid pod forward endpoint '{spec}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| XecError::ConfigInvalid(format!("invalid port in '{spec}'")))?;
        return Ok(ForwardEndpoint::Pod { pod_token: name.to_string(), port });
    }
    let (host, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| XecError::ConfigInvalid(format!("invalid forward endpoint '{spec}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| XecError::ConfigInvalid(format!("invalid port in '{spec}'")))?;
    Ok(ForwardEndpoint::Remote { target_token: host.to_string(), port })
}

/// An active port forward, regardless of which substrate set it up.
pub enum Forward {
    /// A local↔remote forward over a pooled SSH session.
    Ssh(Tunnel),
    /// A `kubectl port-forward` subprocess.
    K8s(K8sPortForward),
}

impl Forward {
    /// Whether the forward is still accepting connections.
    pub async fn is_alive(&mut self) -> bool {
        match self {
            Forward::Ssh(tunnel) => !tunnel.is_closed(),
            Forward::K8s(pf) => pf.is_alive().await,
        }
    }

    /// Tear the forward down.
    ///
    /// # Errors
    /// Propagates `XecError::TunnelClosed` if an SSH forward was already
    /// closed, or a spawn-related I/O error for a Kubernetes forward.
    pub async fn stop(self) -> XecResult<()> {
        match self {
            Forward::Ssh(tunnel) => tunnel.close().await,
            Forward::K8s(mut pf) => pf.stop().await,
        }
    }
}

/// Open a forward from `local_addr` to `destination`, dispatching to the SSH
/// or Kubernetes adapter depending on which kind of target `destination`
/// resolves to.
///
/// # Errors
/// Returns `XecError::Unsupported` if `destination` resolves to a target
/// with no forwarding support (local, Docker, remote-docker). Propagates
/// connection/pool errors from the SSH or `kubectl` path otherwise.
pub async fn open(
    destination: &Target,
    local_addr: SocketAddr,
    remote_port: u16,
    ssh_pool: Arc<SshPool>,
) -> XecResult<Forward> {
    match destination {
        Target::Ssh(spec) => {
            let remote_endpoint = format!("127.0.0.1:{remote_port}");
            let adapter = crate::adapter::ssh::SshAdapter::new(spec.clone(), ssh_pool);
            let tunnel = open_ssh_tunnel(&adapter, local_addr, remote_endpoint).await?;
            Ok(Forward::Ssh(tunnel))
        }
        Target::K8s(spec) => {
            let k8s = crate::adapter::k8s::K8sAdapter::new(spec.clone())?;
            let pf = k8s.port_forward(local_addr.port(), remote_port).await?;
            Ok(Forward::K8s(pf))
        }
        other => Err(XecError::Unsupported(format!(
            "{} targets do not support port forwarding",
            other.label()
        ))),
    }
}

async fn open_ssh_tunnel(
    adapter: &crate::adapter::ssh::SshAdapter,
    local_addr: SocketAddr,
    remote_endpoint: String,
) -> XecResult<Tunnel> {
    adapter.open_tunnel(local_addr, remote_endpoint).await
}

/// Build the remote-side `SshSpec`/`K8sSpec`-independent socket address a
/// forward should bind locally, honoring an explicit `0.0.0.0`/`127.0.0.1`
/// bind host override (default loopback-only, matching the tunnel's scope).
#[must_use]
pub fn local_bind_addr(bind_host: Option<&str>, port: u16) -> SocketAddr {
    let host = bind_host.unwrap_or("127.0.0.1");
    format!("{host}:{port}").parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_port() {
        assert!(matches!(parse_endpoint("8080").unwrap(), ForwardEndpoint::LocalPort(8080)));
    }

    #[test]
    fn parses_host_port() {
        match parse_endpoint("prod-1:5432").unwrap() {
            ForwardEndpoint::Remote { target_token, port } => {
                assert_eq!(target_token, "prod-1");
                assert_eq!(port, 5432);
            }
            other => panic!("unexpected endpoint: {other:?}"),
        }
    }

    #[test]
    fn parses_pod_endpoint() {
        match parse_endpoint("pod:redis:6379").unwrap() {
            ForwardEndpoint::Pod { pod_token, port } => {
                assert_eq!(pod_token, "redis");
                assert_eq!(port, 6379);
            }
            other => panic!("unexpected endpoint: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_endpoint() {
        assert!(parse_endpoint("not-a-valid-endpoint-at-all-no-colon").is_err());
    }

    #[test]
    fn local_bind_defaults_to_loopback() {
        let addr = local_bind_addr(None, 9000);
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
    }
}
