/// Placement group management for Hetzner Cloud
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use super::client::HetznerCloudClient;
use super::models::PlacementGroup;
use crate::labels::selector;

/// Placement group manager
pub struct PlacementGroupManager {
    client: HetznerCloudClient,
}

impl PlacementGroupManager {
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// Create or reuse a spread placement group with the given labels.
    pub async fn ensure_spread_group(
        &self,
        name: &str,
        group_labels: &HashMap<String, String>,
    ) -> Result<PlacementGroup> {
        let existing = self
            .client
            .list_placement_groups(&selector(group_labels))
            .await?;
        if let Some(group) = existing.into_iter().find(|g| g.name == name) {
            info!(
                "Found existing placement group: {} (ID: {})",
                group.name, group.id
            );
            return Ok(group);
        }

        info!("Creating placement group {}", name);

        #[derive(serde::Serialize)]
        struct CreatePlacementGroupRequest<'a> {
            name: &'a str,
            #[serde(rename = "type")]
            group_type: &'a str,
            labels: &'a HashMap<String, String>,
        }

        let group = self
            .client
            .create_placement_group(&CreatePlacementGroupRequest {
                name,
                group_type: "spread",
                labels: group_labels,
            })
            .await
            .context("Failed to create placement group")?;

        info!(
            "Placement group created successfully: {} (ID: {})",
            group.name, group.id
        );

        Ok(group)
    }
}
