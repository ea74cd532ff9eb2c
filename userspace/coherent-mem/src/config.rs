// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! TOML configuration of the coherent memory service.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Unknown keys are rejected.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::address_space::DEFAULT_PROCFS_ROOT;
use crate::control::ParseMode;
use crate::discovery::{
    DeviceTreeDiscovery, Discovery, StaticDiscovery, DEFAULT_COMPATIBLE, DEFAULT_DEVICE_TREE_ROOT,
};
use crate::error::{Error, Result};
use crate::region::{RegionDescriptor, DEFAULT_MAX_REGIONS};
use crate::store::DEFAULT_SYSFS_ROOT;
use crate::tier::{NodeId, TierMap, COHERENT_TIER_NODE, DEFAULT_FAULT_NODES, DEFAULT_TIER_NODE};

/// Default control socket path.
pub const DEFAULT_SOCKET: &str = "/run/coherentd.sock";
/// Default migration control file.
pub const DEFAULT_MIGRATE_FILE: &str = "/sys/kernel/debug/coherent_debug";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub hotplug: HotplugConfig,
    pub discovery: DiscoveryConfig,
    pub tiers: TierConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HotplugConfig {
    /// Root of the memory-block store.
    pub sysfs_root: PathBuf,
    /// Registry capacity.
    pub max_regions: usize,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self { sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT), max_regions: DEFAULT_MAX_REGIONS }
    }
}

/// Where region descriptors come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoverySource {
    /// `[[discovery.regions]]` entries.
    #[default]
    Static,
    /// Unpacked device tree.
    DeviceTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub source: DiscoverySource,
    pub device_tree_root: PathBuf,
    pub compatible: String,
    pub regions: Vec<RegionDescriptor>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            source: DiscoverySource::Static,
            device_tree_root: PathBuf::from(DEFAULT_DEVICE_TREE_ROOT),
            compatible: DEFAULT_COMPATIBLE.to_string(),
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfig {
    pub default_node: NodeId,
    pub coherent_node: NodeId,
    /// Nodes fault allocations alternate across, first pick first.
    pub fault_nodes: [NodeId; 2],
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            default_node: DEFAULT_TIER_NODE,
            coherent_node: COHERENT_TIER_NODE,
            fault_nodes: DEFAULT_FAULT_NODES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub socket: PathBuf,
    pub migrate_file: PathBuf,
    pub procfs_root: PathBuf,
    /// Reject malformed text commands instead of defaulting fields to 0.
    pub strict: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
            migrate_file: PathBuf::from(DEFAULT_MIGRATE_FILE),
            procfs_root: PathBuf::from(DEFAULT_PROCFS_ROOT),
            strict: false,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        debug!("coherent: loaded config from {}", path.display());
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.hotplug.max_regions == 0 {
            return Err(Error::Config("hotplug.max_regions must be positive".into()));
        }
        if self.tiers.default_node == self.tiers.coherent_node {
            return Err(Error::Config(format!(
                "tiers.default_node and tiers.coherent_node are both {}",
                self.tiers.default_node
            )));
        }
        Ok(())
    }

    pub fn tier_map(&self) -> TierMap {
        TierMap { default: self.tiers.default_node, coherent: self.tiers.coherent_node }
    }

    pub fn parse_mode(&self) -> ParseMode {
        if self.control.strict {
            ParseMode::Strict
        } else {
            ParseMode::Lenient
        }
    }

    /// Builds the configured region source.
    pub fn discovery(&self) -> Box<dyn Discovery> {
        match self.discovery.source {
            DiscoverySource::Static => {
                Box::new(StaticDiscovery::new(self.discovery.regions.clone()))
            }
            DiscoverySource::DeviceTree => Box::new(DeviceTreeDiscovery::new(
                self.discovery.device_tree_root.clone(),
                self.discovery.compatible.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.hotplug.max_regions, 100);
        assert_eq!(config.tier_map(), TierMap::default());
        assert_eq!(config.parse_mode(), ParseMode::Lenient);
    }

    #[test]
    fn full_document() {
        let config = Config::from_toml_str(
            r#"
            [hotplug]
            sysfs_root = "/tmp/memory"
            max_regions = 4

            [discovery]
            source = "static"

            [[discovery.regions]]
            base = 0x1000000
            size = 0x400000

            [tiers]
            default_node = 0
            coherent_node = 3
            fault_nodes = [3, 1]

            [control]
            strict = true
            "#,
        )
        .unwrap();
        assert_eq!(config.hotplug.max_regions, 4);
        assert_eq!(config.discovery.regions, [RegionDescriptor::new(0x1000000, 0x400000)]);
        assert_eq!(config.tiers.fault_nodes, [NodeId(3), NodeId(1)]);
        assert_eq!(config.parse_mode(), ParseMode::Strict);
        assert_eq!(config.discovery().discover().unwrap().len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("[hotplug]\nprobe_delay = 3\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(Config::from_toml_str("[extra]\n"), Err(Error::Config(_))));
    }

    #[test]
    fn nonsense_values_are_rejected() {
        assert!(Config::from_toml_str("[hotplug]\nmax_regions = 0\n").is_err());
        assert!(Config::from_toml_str("[tiers]\ndefault_node = 2\n").is_err());
        assert!(Config::from_toml_str("[discovery]\nsource = \"acpi\"\n").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coherentd.toml");
        fs::write(&path, "[control]\nsocket = \"/tmp/c.sock\"\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().control.socket, PathBuf::from("/tmp/c.sock"));
        assert!(matches!(Config::load(&dir.path().join("missing.toml")), Err(Error::Config(_))));
    }
}
