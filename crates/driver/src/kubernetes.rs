//! Kubernetes backend.
//!
//! Each entity is a bare Pod labelled `app=<name>` plus a NodePort Service
//! `<name>-service` selecting it. The service publishes every container port
//! and the allocated node ports become the reachable ports. File transfer runs
//! `tar` inside the pod through `kubectl exec`.

use crate::archive;
use crate::command::Invocation;
use crate::error::ok_if_missing;
use crate::{Driver, DriverError, DriverOptions, PortMap, RunOutput, RunSpec, MANAGED_IMAGES};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const KUBECTL: &str = "kubectl";

const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct KubernetesDriver {
    options: DriverOptions,
    namespace: OnceCell<()>,
}

impl KubernetesDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            options,
            namespace: OnceCell::new(),
        }
    }

    fn ns(&self) -> &str {
        &self.options.namespace
    }

    fn kubectl<I, S>(&self, args: I) -> Invocation<'static>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full: Vec<String> = vec!["-n".to_string(), self.ns().to_string()];
        full.extend(args.into_iter().map(Into::into));
        Invocation::new(KUBECTL, full)
    }

    fn exec<I, S>(&self, name: &str, command: I) -> Invocation<'static>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = vec!["exec".to_string(), "-i".to_string(), name.to_string(), "--".to_string()];
        args.extend(command.into_iter().map(Into::into));
        self.kubectl(args).subject(name)
    }

    async fn create(&self, manifest: &Value, subject: &str) -> Result<Value, DriverError> {
        let body = serde_json::to_vec(manifest)
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        let stdout = self
            .kubectl(["create", "-f", "-", "-o", "json"])
            .subject(subject)
            .stdin(body)
            .output()
            .await?;
        serde_json::from_slice(&stdout).map_err(|e| DriverError::InvalidResponse(e.to_string()))
    }

    async fn wait_for_address(&self, name: &str) -> Result<String, DriverError> {
        let deadline = Instant::now() + self.options.address_timeout;
        loop {
            let address = self
                .kubectl(["get", "pod", name, "-o", "jsonpath={.status.podIP}"])
                .subject(name)
                .text()
                .await?;
            if !address.is_empty() {
                return Ok(address);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(
                    format!("address of {name}"),
                    self.options.address_timeout,
                ));
            }
            debug!(entity = %name, "Waiting for pod address");
            tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
        }
    }

    async fn list_names(&self, kind: &str) -> Result<Vec<String>, DriverError> {
        let listing = self
            .kubectl(["get", kind, "-o", "jsonpath={.items[*].metadata.name}"])
            .text()
            .await?;
        Ok(listing
            .split_whitespace()
            .filter(|name| is_managed_name(name))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Driver for KubernetesDriver {
    async fn prepare(&self) -> Result<(), DriverError> {
        self.namespace
            .get_or_try_init(|| async {
                if self.options.reuse_namespace {
                    info!(namespace = %self.ns(), "Reusing namespace");
                    return Ok::<(), DriverError>(());
                }
                Invocation::new(KUBECTL, ["create", "namespace", self.ns()])
                    .subject(self.ns())
                    .run()
                    .await?;
                info!(namespace = %self.ns(), "Created namespace");
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Images are pulled by the cluster itself.
    async fn has_image(&self, _name: &str) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn build(&self, _name: &str, _path: &Path) -> Result<(), DriverError> {
        Ok(())
    }

    async fn pull(&self, _name: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, DriverError> {
        self.create(&pod_manifest(spec), &spec.name).await?;

        let address = if spec.skip_address_wait {
            String::new()
        } else {
            self.wait_for_address(&spec.name).await?
        };

        let service = self.create(&service_manifest(spec), &spec.name).await?;
        let ports = parse_node_ports(&service)?;
        info!(entity = %spec.name, address = %address, ?ports, "Started");

        Ok(RunOutput { address, ports })
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        ok_if_missing(
            self.kubectl(["delete", "pod", name, "--wait=false"])
                .subject(name)
                .run()
                .await,
        )?;
        ok_if_missing(
            self.kubectl(["delete".to_string(), "service".to_string(), service_name(name)])
                .subject(name)
                .run()
                .await,
        )?;
        info!(entity = %name, "Stopped");
        Ok(())
    }

    async fn download(&self, name: &str, remote: &str, local: &Path) -> Result<(), DriverError> {
        let (parent, target) = archive::split_remote(remote);
        let bytes = self
            .exec(name, ["tar", "cf", "-", "-C", parent, target])
            .output()
            .await?;
        archive::unpack(&bytes, local)
    }

    async fn peek(&self, name: &str, remote: &str) -> Result<String, DriverError> {
        let stdout = self.exec(name, ["cat", remote]).output().await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn upload(&self, name: &str, local: &Path, remote: &str) -> Result<(), DriverError> {
        let bytes = archive::pack_file(local, remote)?;
        self.exec(name, ["tar", "xf", "-", "-C", "/"])
            .stdin(bytes)
            .run()
            .await
    }

    async fn cleanup(&self, _image_prefix: &str) -> Result<(), DriverError> {
        let pods = self.list_names("pods").await?;
        let failures = self.stop_many(&pods).await;
        if failures > 0 {
            warn!(failures, "Some pods could not be removed");
        }

        // Services whose pod is already gone.
        for service in self.list_names("services").await? {
            ok_if_missing(
                self.kubectl(["delete", "service", service.as_str()])
                    .subject(service.as_str())
                    .run()
                    .await,
            )?;
        }

        if !self.options.reuse_namespace {
            ok_if_missing(
                Invocation::new(KUBECTL, ["delete", "namespace", self.ns()])
                    .subject(self.ns())
                    .run()
                    .await,
            )?;
            info!(namespace = %self.ns(), "Removed namespace");
        }
        Ok(())
    }
}

fn service_name(name: &str) -> String {
    format!("{name}-service")
}

fn is_managed_name(name: &str) -> bool {
    MANAGED_IMAGES.iter().any(|base| name.contains(base))
}

fn pod_manifest(spec: &RunSpec) -> Value {
    let quantity = json!({
        "cpu": spec.resources.cpu,
        "memory": format!("{}Mi", spec.resources.memory_mib),
    });
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": spec.name, "labels": { "app": spec.name } },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": spec.name,
                "image": spec.image,
                "ports": spec.ports.keys()
                    .map(|port| json!({ "containerPort": port }))
                    .collect::<Vec<_>>(),
                "env": spec.env.iter()
                    .map(|(k, v)| json!({ "name": k, "value": v }))
                    .collect::<Vec<_>>(),
                "securityContext": {
                    "allowPrivilegeEscalation": false,
                    "capabilities": { "drop": ["ALL"] },
                    "runAsNonRoot": true,
                    "seccompProfile": { "type": "RuntimeDefault" },
                },
                "resources": { "limits": quantity, "requests": quantity },
            }],
        },
    })
}

fn service_manifest(spec: &RunSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": service_name(&spec.name) },
        "spec": {
            "type": "NodePort",
            "selector": { "app": spec.name },
            "ports": spec.ports.iter()
                .map(|(container_port, host_port)| json!({
                    "name": format!("{}-{}", spec.name, host_port),
                    "protocol": "TCP",
                    "port": host_port,
                    "targetPort": container_port,
                }))
                .collect::<Vec<_>>(),
        },
    })
}

/// Container port -> allocated node port, read from a created Service.
fn parse_node_ports(service: &Value) -> Result<PortMap, DriverError> {
    let ports = service
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .ok_or_else(|| DriverError::InvalidResponse("service without ports".to_string()))?;

    ports
        .iter()
        .map(|port| {
            let target = port.get("targetPort").and_then(Value::as_u64);
            let node = port.get("nodePort").and_then(Value::as_u64);
            match (target, node) {
                (Some(target), Some(node)) => Ok((target as u16, node as u16)),
                _ => Err(DriverError::InvalidResponse(format!(
                    "unexpected service port: {port}"
                ))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixsim_types::Resources;

    fn client_spec() -> RunSpec {
        RunSpec::new("wasabi-client-007", "registry/wasabi-client:2.0.4")
            .with_port(37128, 37136)
            .with_env("ADDR_BTC_NODE", "10.0.0.4")
            .with_resources(Resources::new(0.1, 768))
    }

    #[test]
    fn test_pod_manifest() {
        let pod = pod_manifest(&client_spec());
        assert_eq!(pod["metadata"]["labels"]["app"], "wasabi-client-007");
        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["image"], "registry/wasabi-client:2.0.4");
        assert_eq!(container["ports"][0]["containerPort"], 37128);
        assert_eq!(container["env"][0]["name"], "ADDR_BTC_NODE");
        assert_eq!(container["resources"]["limits"]["memory"], "768Mi");
        assert_eq!(container["resources"]["requests"]["cpu"], 0.1);
    }

    #[test]
    fn test_service_manifest() {
        let service = service_manifest(&client_spec());
        assert_eq!(service["metadata"]["name"], "wasabi-client-007-service");
        assert_eq!(service["spec"]["type"], "NodePort");
        assert_eq!(service["spec"]["selector"]["app"], "wasabi-client-007");
        let port = &service["spec"]["ports"][0];
        assert_eq!(port["port"], 37136);
        assert_eq!(port["targetPort"], 37128);
    }

    #[test]
    fn test_parse_node_ports() {
        let created = json!({
            "spec": { "ports": [
                { "port": 18443, "targetPort": 18443, "nodePort": 31443 },
                { "port": 18444, "targetPort": 18444, "nodePort": 31444 },
            ]}
        });
        let ports = parse_node_ports(&created).unwrap();
        assert_eq!(ports.get(&18443), Some(&31443));
        assert_eq!(ports.get(&18444), Some(&31444));

        let broken = json!({ "spec": { "ports": [{ "port": 1 }] } });
        assert!(parse_node_ports(&broken).is_err());
        assert!(parse_node_ports(&json!({})).is_err());
    }

    #[test]
    fn test_managed_names() {
        assert!(is_managed_name("btc-node"));
        assert!(is_managed_name("wasabi-client-003-service"));
        assert!(!is_managed_name("ingress-nginx"));
    }
}
