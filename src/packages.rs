//! Package artifacts an install task resolves to.

use serde::Serialize;
use vertera_proto::PackageKind;

/// OVS release used when a task names none.
pub const DEFAULT_OVS_VERSION: &str = "3.6.0";
/// Cloud Hypervisor release used when a task names none.
pub const DEFAULT_CH_VERSION: &str = "47.0";
/// OS release used when a task names none.
pub const DEFAULT_OS_VERSION: &str = "el9";

/// One file an install would fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// File name.
    pub name: String,
    /// Download URL.
    pub url: String,
    /// Optional artifacts are listed but skipped.
    pub required: bool,
}

/// Artifacts for `kind` at the requested (or default) versions.
pub fn resolve_artifacts(
    kind: PackageKind,
    version: Option<&str>,
    os_version: Option<&str>,
) -> Vec<Artifact> {
    match kind {
        PackageKind::Ovs => {
            let version = version.unwrap_or(DEFAULT_OVS_VERSION);
            let os = os_version.unwrap_or(DEFAULT_OS_VERSION);
            let base = format!(
                "https://github.com/VerteraIO/openvswitch-rpm-build/releases/download/v{version}/"
            );
            [
                (format!("openvswitch-selinux-policy-{version}-1.{os}.noarch.rpm"), false),
                (format!("openvswitch-{version}-1.{os}.x86_64.rpm"), true),
                (format!("python3-openvswitch-{version}-1.{os}.noarch.rpm"), false),
            ]
            .into_iter()
            .map(|(name, required)| Artifact {
                url: format!("{base}{name}"),
                name,
                required,
            })
            .collect()
        }
        PackageKind::CloudHypervisor => {
            let version = version.unwrap_or(DEFAULT_CH_VERSION);
            let name = format!("cloud-hypervisor-{version}.0-1.g88ffa129.el10.x86_64.rpm");
            vec![Artifact {
                url: format!(
                    "https://github.com/VerteraIO/cloud-hypervisor-build/releases/download/v{version}/{name}"
                ),
                name,
                required: true,
            }]
        }
    }
}
