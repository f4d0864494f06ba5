// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! [`LinkResolver`] backed by `/sys/class/net` and `/proc/net/route`.

use crate::domain::link::{LinkError, LinkResolver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const SYS_CLASS_NET: &str = "/sys/class/net";
const PROC_NET_ROUTE: &str = "/proc/net/route";
const DEFAULT_DESTINATION: &str = "00000000";

pub struct SysfsLinkResolver {
    net_dir: PathBuf,
    route_table: PathBuf,
}

impl SysfsLinkResolver {
    pub fn new() -> Self {
        Self::with_roots(SYS_CLASS_NET, PROC_NET_ROUTE)
    }

    pub fn with_roots(net_dir: impl Into<PathBuf>, route_table: impl Into<PathBuf>) -> Self {
        Self {
            net_dir: net_dir.into(),
            route_table: route_table.into(),
        }
    }

    async fn read_index(&self, path: &Path) -> Result<u32, LinkError> {
        let content = tokio::fs::read_to_string(path).await?;
        content.trim().parse().map_err(|e: std::num::ParseIntError| LinkError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

impl Default for SysfsLinkResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Interface of the first `0.0.0.0/0` entry in a `/proc/net/route` table.
pub fn parse_default_route(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [iface, destination, ..] if *destination == DEFAULT_DESTINATION => {
                let mask_is_zero = fields.get(7).map_or(true, |m| *m == DEFAULT_DESTINATION);
                mask_is_zero.then(|| iface.to_string())
            }
            _ => None,
        }
    })
}

#[async_trait]
impl LinkResolver for SysfsLinkResolver {
    async fn pod_link_index(&self, interface: &str) -> Result<u32, LinkError> {
        let path = self.net_dir.join(interface).join("iflink");
        match self.read_index(&path).await {
            Err(LinkError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LinkError::InterfaceNotFound(interface.to_string()))
            }
            other => other,
        }
    }

    async fn host_interface_for(&self, index: u32) -> Result<Option<String>, LinkError> {
        for name in self.interfaces().await? {
            let path = self.net_dir.join(&name).join("ifindex");
            match self.read_index(&path).await {
                Ok(found) if found == index => return Ok(Some(name)),
                Ok(_) => {}
                // Interfaces can vanish between listing and reading.
                Err(LinkError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn default_route_interface(&self) -> Result<String, LinkError> {
        let table = tokio::fs::read_to_string(&self.route_table).await?;
        parse_default_route(&table).ok_or(LinkError::NoDefaultRoute)
    }

    async fn interfaces(&self) -> Result<Vec<String>, LinkError> {
        let mut entries = tokio::fs::read_dir(&self.net_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
        br-ex\t0080A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n\
        br-ex\t00000000\t0180A8C0\t0003\t0\t0\t48\t00000000\t0\t0\t0\n";

    fn write_iface(root: &Path, name: &str, ifindex: u32, iflink: u32) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ifindex"), format!("{}\n", ifindex)).unwrap();
        std::fs::write(dir.join("iflink"), format!("{}\n", iflink)).unwrap();
    }

    #[test]
    fn test_parse_default_route() {
        assert_eq!(parse_default_route(ROUTES).as_deref(), Some("br-ex"));
        assert_eq!(parse_default_route("Iface\tDestination\n"), None);
    }

    #[tokio::test]
    async fn test_sysfs_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let net = dir.path().join("net");
        write_iface(&net, "eth0", 3, 17);
        write_iface(&net, "lo", 1, 1);
        write_iface(&net, "veth3a9f", 17, 3);
        let route = dir.path().join("route");
        std::fs::write(&route, ROUTES).unwrap();

        let resolver = SysfsLinkResolver::with_roots(&net, &route);
        assert_eq!(resolver.pod_link_index("eth0").await.unwrap(), 17);
        assert_eq!(
            resolver.host_interface_for(17).await.unwrap().as_deref(),
            Some("veth3a9f")
        );
        assert_eq!(resolver.host_interface_for(99).await.unwrap(), None);
        assert_eq!(resolver.default_route_interface().await.unwrap(), "br-ex");
        assert_eq!(
            resolver.interfaces().await.unwrap(),
            vec!["eth0".to_string(), "lo".to_string(), "veth3a9f".to_string()]
        );
        assert!(matches!(
            resolver.pod_link_index("eth9").await,
            Err(LinkError::InterfaceNotFound(_))
        ));
    }
}
