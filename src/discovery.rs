use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheWriter, Snapshot};
use crate::proxmox::{Client, ClientError};
use crate::targets::{self, TargetGroup};

/// Periodically walks every node and VM of the cluster and stores the
/// resulting targets in the cache file.
pub struct Discovery {
    client: Client,
    subnet: Ipv4Net,
    writer: CacheWriter,
}

impl Discovery {
    pub fn new(client: Client, subnet: Ipv4Net, writer: CacheWriter) -> Self {
        Self {
            client,
            subnet,
            writer,
        }
    }

    /// One full pass over the cluster. Any failure replaces the whole target
    /// list, a partial list would make Prometheus drop healthy targets.
    pub async fn run_once(&self) -> Snapshot {
        match self.discover().await {
            Ok(groups) => Snapshot::Targets(groups),
            Err(err) => {
                warn!(
                    message = "discovery failed",
                    endpoint = self.client.endpoint(),
                    %err,
                );

                Snapshot::error(err)
            }
        }
    }

    async fn discover(&self) -> Result<Vec<TargetGroup>, ClientError> {
        let session = self.client.authenticate().await?;
        let mut groups = Vec::new();

        for node in self.client.list_nodes(&session).await? {
            let node = node.node;

            for vm in self.client.list_vms(&session, &node).await? {
                let config = self
                    .client
                    .get_vm_config(&session, &node, vm.vmid)
                    .await?;

                // skipped VMs are often stopped or templates, their agent is
                // never asked
                if targets::parse_tags(config.tags.as_deref().unwrap_or_default()).skipped {
                    debug!(message = "vm skipped", node = node.as_str(), vmid = vm.vmid);
                    continue;
                }

                let interfaces = self
                    .client
                    .get_network_interfaces(&session, &node, vm.vmid)
                    .await?;

                let built = targets::build(&node, vm.vmid, &config, &interfaces, &self.subnet);
                if built.first().is_some_and(|group| group.targets.is_empty()) {
                    debug!(
                        message = "vm has no address in subnet",
                        node = node.as_str(),
                        vmid = vm.vmid,
                        subnet = %self.subnet,
                    );
                }

                groups.extend(built);
            }
        }

        Ok(groups)
    }

    /// Run a cycle now and then every `interval` until `shutdown` fires. A
    /// slow cycle delays the next one, cycles never overlap.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            message = "discovery started",
            endpoint = self.client.endpoint(),
            interval = ?interval,
            cache = ?self.writer.path(),
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let start = Instant::now();
            let snapshot = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                snapshot = self.run_once() => snapshot,
            };

            if let Err(err) = self.writer.write(&snapshot.to_json()).await {
                error!(
                    message = "write cache file failed",
                    path = ?self.writer.path(),
                    %err,
                );

                continue;
            }

            match &snapshot {
                Snapshot::Targets(groups) => info!(
                    message = "discovery finished",
                    groups = groups.len(),
                    elapsed = ?start.elapsed(),
                ),
                Snapshot::Error { .. } => {}
            }
        }

        info!(message = "discovery stopped");
    }
}
