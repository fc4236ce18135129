use super::{DeviceDescriptor, DiscoveryBackend, DiscoveryReport, DiscoveryResult};

/// Uses `secondary` whenever `primary` fails as a whole.
///
/// Per-device failures of the primary are not retried on the secondary.
pub struct FallbackBackend {
    primary: Box<dyn DiscoveryBackend>,
    secondary: Box<dyn DiscoveryBackend>,
}

impl FallbackBackend {
    pub fn new(primary: Box<dyn DiscoveryBackend>, secondary: Box<dyn DiscoveryBackend>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn discover(&self) -> DiscoveryResult<DiscoveryReport> {
        match self.primary.discover().await {
            Ok(report) => Ok(report),
            Err(error) => {
                tracing::warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    "primary discovery failed, falling back: {}",
                    error
                );
                self.secondary.discover().await
            }
        }
    }

    async fn describe(&self, device_id: &str) -> DiscoveryResult<DeviceDescriptor> {
        match self.primary.describe(device_id).await {
            Ok(descriptor) => Ok(descriptor),
            Err(error) => {
                tracing::debug!(device_id, "primary describe failed: {}", error);
                self.secondary.describe(device_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::StaticBackend;
    use super::*;

    #[tokio::test]
    async fn falls_back_only_when_primary_fails() {
        let healthy = FallbackBackend::new(
            Box::new(StaticBackend::with_devices(vec![DeviceDescriptor::new(
                "card0", "primary", 1,
            )])),
            Box::new(StaticBackend::with_devices(vec![DeviceDescriptor::new(
                "card0", "secondary", 1,
            )])),
        );
        assert_eq!(healthy.discover().await.unwrap().devices[0].model, "primary");

        let outage = FallbackBackend::new(
            Box::new(StaticBackend::unavailable()),
            Box::new(StaticBackend::with_devices(vec![DeviceDescriptor::new(
                "card0", "secondary", 1,
            )])),
        );
        assert_eq!(outage.discover().await.unwrap().devices[0].model, "secondary");
        assert_eq!(outage.describe("card0").await.unwrap().model, "secondary");
    }
}
