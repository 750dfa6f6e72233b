//! Image preparation.

use crate::SimulationConfig;
use mixsim_driver::{Driver, DriverError, CLIENT_IMAGE, COORDINATOR_IMAGE, NODE_IMAGE};
use mixsim_types::ClientVersion;
use std::path::PathBuf;
use tracing::info;

/// How an image was made available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAction {
    Reused,
    Pulled,
    Built,
}

/// One image to make available, with its build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Unprefixed name, with tag for clients.
    pub name: String,
    pub context: PathBuf,
}

/// Full (prefixed) image reference of a wallet client version.
pub fn client_image(config: &SimulationConfig, version: &ClientVersion) -> String {
    format!("{}{CLIENT_IMAGE}:{version}", config.image_prefix)
}

/// Full (prefixed) image reference of an infrastructure image.
pub fn infra_image(config: &SimulationConfig, name: &str) -> String {
    format!("{}{name}", config.image_prefix)
}

/// Node, coordinator and one client image per version.
pub fn required_images<'a>(
    config: &SimulationConfig,
    versions: impl IntoIterator<Item = &'a ClientVersion>,
) -> Vec<ImageSpec> {
    let dir = &config.containers_dir;
    let mut images = vec![
        ImageSpec {
            name: NODE_IMAGE.to_string(),
            context: dir.join(NODE_IMAGE),
        },
        ImageSpec {
            name: COORDINATOR_IMAGE.to_string(),
            context: dir.join(COORDINATOR_IMAGE),
        },
    ];
    images.extend(versions.into_iter().map(|version| ImageSpec {
        name: format!("{CLIENT_IMAGE}:{version}"),
        context: dir
            .join("wasabi-clients")
            .join(format!("v{}", version.major()))
            .join(version.as_str()),
    }));
    images
}

/// Make one image available: reuse it unless a rebuild is forced, pull it
/// when a registry prefix is set, build it otherwise.
pub async fn prepare_image(
    driver: &dyn Driver,
    config: &SimulationConfig,
    image: &ImageSpec,
) -> Result<ImageAction, DriverError> {
    let prefixed = format!("{}{}", config.image_prefix, image.name);
    if driver.has_image(&prefixed).await? && !config.force_rebuild {
        info!(image = %prefixed, "Image reused");
        return Ok(ImageAction::Reused);
    }

    if config.image_prefix.is_empty() {
        driver.build(&image.name, &image.context).await?;
        info!(image = %prefixed, "Image built");
        Ok(ImageAction::Built)
    } else {
        driver.pull(&prefixed).await?;
        info!(image = %prefixed, "Image pulled");
        Ok(ImageAction::Pulled)
    }
}

/// Prepare every image the scenario needs, in order.
pub async fn prepare_images<'a>(
    driver: &dyn Driver,
    config: &SimulationConfig,
    versions: impl IntoIterator<Item = &'a ClientVersion>,
) -> Result<(), DriverError> {
    info!("Preparing images");
    for image in required_images(config, versions) {
        prepare_image(driver, config, &image).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixsim_test_helpers::{DriverCall, MemoryDriver};
    use mixsim_types::Scenario;
    use std::path::Path;

    #[test]
    fn test_required_images() {
        let mut scenario = Scenario::default();
        scenario.distributor_version = Some("1.1.12.9".parse().unwrap());
        let versions = scenario.client_versions();
        let images = required_images(&SimulationConfig::default(), &versions);

        let names: Vec<_> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "btc-node",
                "wasabi-backend",
                "wasabi-client:1.1.12.9",
                "wasabi-client:2.0.4"
            ]
        );
        assert_eq!(
            images[2].context,
            Path::new("./containers/wasabi-clients/v1/1.1.12.9")
        );

        let config = SimulationConfig::default().with_image_prefix("ghcr.io/mix/");
        assert_eq!(
            client_image(&config, &ClientVersion::v2_0_4()),
            "ghcr.io/mix/wasabi-client:2.0.4"
        );
        assert_eq!(infra_image(&config, NODE_IMAGE), "ghcr.io/mix/btc-node");
    }

    #[tokio::test]
    async fn test_reuse_build_and_pull() {
        let image = ImageSpec {
            name: "btc-node".to_string(),
            context: "./containers/btc-node".into(),
        };

        let driver = MemoryDriver::new().with_image("btc-node");
        let config = SimulationConfig::default();
        assert_eq!(
            prepare_image(&driver, &config, &image).await.unwrap(),
            ImageAction::Reused
        );

        let forced = config.clone().with_force_rebuild(true);
        assert_eq!(
            prepare_image(&driver, &forced, &image).await.unwrap(),
            ImageAction::Built
        );
        assert_eq!(driver.count(&DriverCall::Build("btc-node".into())), 1);

        let registry = config.with_image_prefix("registry.local/");
        assert_eq!(
            prepare_image(&driver, &registry, &image).await.unwrap(),
            ImageAction::Pulled
        );
        assert_eq!(
            driver.count(&DriverCall::Pull("registry.local/btc-node".into())),
            1
        );
    }
}
