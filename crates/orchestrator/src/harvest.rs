//! Shutdown & harvest.
//!
//! Runs after the main phases however they ended. Participation is stopped
//! first, artifacts are then collected into an experiment directory and
//! archived, and finally every entity is stopped and the runtime cleaned up.
//! Collection is best effort throughout: a missing artifact is logged and
//! skipped, never allowed to prevent teardown.

use crate::error::HarvestError;
use crate::fleet::{ClientRecord, Fleet, Participation};
use crate::infra::{Infrastructure, COORDINATOR_DATA_DIR, COORDINATOR_NAME, NODE_NAME};
use crate::Context;
use futures::stream::{self, StreamExt};
use mixsim_rpc::{Ledger, RpcError};
use mixsim_types::Scenario;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Log directory inside every wallet client.
pub const CLIENT_DATA_DIR: &str = "/home/wasabi/.walletwasabi/client/";

const LIST_ATTEMPTS: u32 = 3;

/// Stop mixing on every client still participating. Individual failures
/// are logged; the flag only flips for successful stops.
pub async fn stop_mixing(ctx: &Context, fleet: &mut Fleet) {
    let active: Vec<usize> = fleet
        .clients
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_active())
        .map(|(index, _)| index)
        .collect();
    if active.is_empty() {
        return;
    }
    info!(clients = active.len(), "Stopping mixing");

    let clients = &fleet.clients;
    let results: Vec<(usize, Result<(), RpcError>)> = stream::iter(active)
        .map(|index| async move { (index, clients[index].wallet.stop_mixing().await) })
        .buffer_unordered(ctx.config.rpc_concurrency)
        .collect()
        .await;

    for (index, result) in results {
        let client = &mut fleet.clients[index];
        match result {
            Ok(()) => {
                client.participation = Participation::Inactive;
                debug!(name = %client.entity.name, "Stopped mixing");
            }
            Err(e) => warn!(name = %client.entity.name, error = %e, "Could not stop mixing"),
        }
    }
}

/// Experiment directory name: UTC timestamp (filesystem safe) and scenario.
pub fn experiment_name(now: SystemTime, scenario: &str) -> String {
    let stamp = humantime::format_rfc3339_seconds(now).to_string();
    format!("{}_{scenario}", stamp.trim_end_matches('Z').replace(':', "-"))
}

async fn write_json(path: &Path, value: &impl Serialize) -> Result<(), HarvestError> {
    let text = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, text)
        .await
        .map_err(HarvestError::io(path))
}

async fn with_attempts<T, F, Fut>(mut call: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= LIST_ATTEMPTS => return Err(e),
            Err(e) => debug!(attempt, error = %e, "Retrying"),
        }
        attempt += 1;
    }
}

async fn fetch_block(ledger: &dyn Ledger, height: u64) -> Result<Value, RpcError> {
    let hash = ledger.block_hash(height).await?;
    ledger.block(&hash).await
}

/// Dump every ledger block as `block_{height}.json`. Returns how many were
/// stored.
async fn store_blocks(
    ledger: &dyn Ledger,
    dir: &Path,
    concurrency: usize,
) -> Result<u64, HarvestError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(HarvestError::io(dir))?;
    let tip = match with_attempts(|| ledger.block_count()).await {
        Ok(tip) => tip,
        Err(e) => {
            warn!(error = %e, "Could not read block count, no blocks stored");
            return Ok(0);
        }
    };

    // The block count is the height of the tip, which is itself a block.
    let stored: Vec<Result<bool, HarvestError>> = stream::iter(0..=tip)
        .map(|height| async move {
            match fetch_block(ledger, height).await {
                Ok(block) => {
                    write_json(&dir.join(format!("block_{height}.json")), &block).await?;
                    Ok(true)
                }
                Err(e) => {
                    warn!(height, error = %e, "Could not store block");
                    Ok(false)
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut blocks = 0;
    for result in stored {
        if result? {
            blocks += 1;
        }
    }
    Ok(blocks)
}

/// Coin and key listings plus the log directory of one client.
async fn store_client(ctx: &Context, client: &ClientRecord, data: &Path) -> Result<(), HarvestError> {
    let name = &client.entity.name;
    let dir = data.join(name);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(HarvestError::io(&dir))?;

    let wallet = client.wallet.as_ref();
    let listings = [
        ("coins.json", with_attempts(|| wallet.list_coins()).await),
        (
            "unspent_coins.json",
            with_attempts(|| wallet.list_unspent_coins()).await,
        ),
        ("keys.json", with_attempts(|| wallet.list_keys()).await),
    ];
    for (file, listing) in listings {
        let value = listing.unwrap_or_else(|e| {
            warn!(name = %name, file, error = %e, "Could not list, storing null");
            Value::Null
        });
        write_json(&dir.join(file), &value).await?;
    }

    match ctx.driver.download(name, CLIENT_DATA_DIR, &dir).await {
        Ok(()) => debug!(name = %name, "Stored client logs"),
        Err(e) => warn!(name = %name, error = %e, "Could not store client logs"),
    }
    Ok(())
}

/// Pack `dir` into `{dir}.tar.lz4` next to it.
pub async fn archive(dir: &Path) -> Result<PathBuf, HarvestError> {
    let dir = dir.to_path_buf();
    let mut target = dir.clone().into_os_string();
    target.push(".tar.lz4");
    let target = PathBuf::from(target);
    let output = target.clone();
    tokio::task::spawn_blocking(move || -> Result<(), HarvestError> {
        let file = std::fs::File::create(&output).map_err(HarvestError::io(&output))?;
        let encoder = lz4_flex::frame::FrameEncoder::new(file);
        let mut builder = tar::Builder::new(encoder);
        let root = dir
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("experiment"));
        builder
            .append_dir_all(root, &dir)
            .map_err(HarvestError::io(&dir))?;
        let encoder = builder.into_inner().map_err(HarvestError::io(&output))?;
        encoder
            .finish()
            .map_err(|e| HarvestError::io(&output)(e.into()))?;
        Ok(())
    })
    .await??;
    Ok(target)
}

/// Collect every artifact of the run into
/// `{log_dir}/{timestamp}_{scenario}/` and archive it. Returns the archive.
pub async fn collect<S: Serialize>(
    ctx: &Context,
    scenario: &Scenario,
    infra: &Infrastructure,
    fleet: &Fleet,
    summary: &S,
) -> Result<PathBuf, HarvestError> {
    let experiment = ctx
        .config
        .log_dir
        .join(experiment_name(SystemTime::now(), &scenario.name));
    let data = experiment.join("data");
    info!(dir = %experiment.display(), "Storing logs");
    tokio::fs::create_dir_all(&data)
        .await
        .map_err(HarvestError::io(&data))?;

    write_json(&experiment.join("scenario.json"), scenario).await?;
    write_json(&experiment.join("summary.json"), summary).await?;

    if let Some(ledger) = infra.ledger() {
        let blocks = store_blocks(
            ledger.as_ref(),
            &data.join(NODE_NAME),
            ctx.config.rpc_concurrency,
        )
        .await?;
        info!(blocks, "Stored blocks");
    }

    if infra.coordinator.is_some() {
        let target = data.join(COORDINATOR_NAME);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(HarvestError::io(&target))?;
        match ctx
            .driver
            .download(COORDINATOR_NAME, COORDINATOR_DATA_DIR, &target)
            .await
        {
            Ok(()) => info!("Stored coordinator logs"),
            Err(e) => warn!(error = %e, "Could not store coordinator logs"),
        }
    }

    let stored: Vec<Result<(), HarvestError>> = stream::iter(&fleet.clients)
        .map(|client| store_client(ctx, client, &data))
        .buffer_unordered(ctx.config.harvest_concurrency)
        .collect()
        .await;
    stored.into_iter().collect::<Result<(), _>>()?;
    info!(clients = fleet.len(), "Stored client data");

    let archive = archive(&experiment).await?;
    info!(archive = %archive.display(), "Archive created");
    Ok(archive)
}

/// Stop the fleet and the infrastructure, then clean up the runtime.
pub async fn teardown(
    ctx: &Context,
    fleet: &mut Fleet,
    infra: &mut Infrastructure,
) -> Result<(), HarvestError> {
    let mut names = fleet.names();
    names.extend(infra.names());
    info!(entities = names.len(), "Stopping entities");

    let failures = ctx.driver.stop_many(&names).await;
    if failures > 0 {
        warn!(failures, "Some entities did not stop cleanly");
    }
    fleet.mark_stopped();
    infra.mark_stopped();

    ctx.driver.cleanup(&ctx.config.image_prefix).await?;
    info!("Cleanup complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::client_name;
    use crate::infra::Managed;
    use crate::SimulationConfig;
    use mixsim_driver::{Driver, RunSpec};
    use mixsim_rpc::Connector;
    use mixsim_test_helpers::{FakeConnector, FakeNetwork, MemoryDriver};
    use mixsim_types::{ClientVersion, Endpoint, EntityHandle, Resources};
    use std::io::Read;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_experiment_name() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            experiment_name(now, "uniformsum-static-10-30utxo"),
            "2023-11-14T22-13-20_uniformsum-static-10-30utxo"
        );
    }

    #[tokio::test]
    async fn test_archive_is_lz4_tar() {
        let dir = tempfile::tempdir().unwrap();
        let experiment = dir.path().join("exp");
        std::fs::create_dir_all(experiment.join("data")).unwrap();
        std::fs::write(experiment.join("data/file.txt"), "content").unwrap();

        let path = archive(&experiment).await.unwrap();
        assert_eq!(path, dir.path().join("exp.tar.lz4"));

        let file = std::fs::File::open(&path).unwrap();
        let mut tar = tar::Archive::new(lz4_flex::frame::FrameDecoder::new(file));
        let mut found = false;
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap() == Path::new("exp/data/file.txt") {
                let mut text = String::new();
                entry.read_to_string(&mut text).unwrap();
                assert_eq!(text, "content");
                found = true;
            }
        }
        assert!(found);
    }

    #[tokio::test]
    async fn test_collect_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryDriver::new());
        let network = FakeNetwork::new();
        network.set_height(3);
        let connector = FakeConnector::new(network.clone());
        let config = SimulationConfig::default().with_log_dir(dir.path());
        let ctx = Context::new(driver.clone(), Arc::new(connector.clone()), config);

        for (name, image) in [
            (NODE_NAME, "btc-node"),
            (COORDINATOR_NAME, "wasabi-backend"),
            ("wasabi-client-000", "wasabi-client:2.0.4"),
        ] {
            driver.run(&RunSpec::new(name, image)).await.unwrap();
        }
        driver.set_file(
            COORDINATOR_NAME,
            "/home/wasabi/.walletwasabi/backend/Logs.txt",
            "backend log",
        );
        driver.set_file(
            "wasabi-client-000",
            "/home/wasabi/.walletwasabi/client/Logs.txt",
            "client log",
        );

        let endpoint = Endpoint::new("localhost", 1);
        let resources = Resources::new(1.0, 1);
        let mut infra = Infrastructure {
            node: Some(Managed {
                entity: EntityHandle::starting(NODE_NAME, endpoint.clone(), "", resources),
                client: Arc::new(connector.fake_ledger()),
            }),
            coordinator: None,
            distributor: None,
        };
        infra.coordinator = Some(Managed {
            entity: EntityHandle::starting(COORDINATOR_NAME, endpoint.clone(), "", resources),
            client: connector.coordinator(&endpoint).unwrap(),
        });
        let mut fleet = Fleet {
            clients: vec![ClientRecord {
                entity: EntityHandle::starting(client_name(0), endpoint, "", resources),
                slot: 0,
                version: ClientVersion::v2_0_4(),
                delay: 0,
                skip_rounds: Default::default(),
                participation: Participation::Active,
                wallet: Arc::new(connector.fake_wallet(&client_name(0))),
            }],
            dropped: vec![1],
        };

        stop_mixing(&ctx, &mut fleet).await;
        assert!(!fleet.clients[0].is_active());
        assert_eq!(network.mixing_calls(&client_name(0)).1, 1);

        let scenario = Scenario::new("harvest", Vec::new());
        let archive = collect(&ctx, &scenario, &infra, &fleet, &serde_json::json!({ "ok": true }))
            .await
            .unwrap();
        assert!(archive.exists());

        let experiment = PathBuf::from(archive.to_string_lossy().trim_end_matches(".tar.lz4"));
        let data = experiment.join("data");
        assert!(experiment.join("scenario.json").exists());
        assert!(experiment.join("summary.json").exists());
        // Genesis through the tip at height 3.
        for height in 0..=3 {
            assert!(data.join(format!("btc-node/block_{height}.json")).exists());
        }
        assert!(!data.join("btc-node/block_4.json").exists());
        assert_eq!(
            std::fs::read_to_string(data.join("wasabi-backend/backend/Logs.txt")).unwrap(),
            "backend log"
        );
        let client = data.join("wasabi-client-000");
        for file in ["coins.json", "unspent_coins.json", "keys.json"] {
            assert!(client.join(file).exists());
        }
        assert_eq!(
            std::fs::read_to_string(client.join("client/Logs.txt")).unwrap(),
            "client log"
        );

        teardown(&ctx, &mut fleet, &mut infra).await.unwrap();
        assert!(driver.running().is_empty());
        assert!(!fleet.clients[0].entity.is_ready());
        assert_eq!(
            fleet.clients[0].entity.state,
            mixsim_types::EntityState::Stopped
        );
    }
}
