//! Resource governance limits from application and service manifests
//!
//! Only the policy nodes that carry limits are modelled. Values may reference
//! application parameters as `[Name]`; those are substituted before parsing.

use crate::error::{ObserverError, Result};
use crate::models::ResourceGovernanceLimits;
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::BTreeMap;

const CODE_PACKAGE_POLICY: &str = "<ResourceGovernancePolicy ";
const SERVICE_PACKAGE_POLICY: &str = "<ServicePackageResourceGovernancePolicy ";

#[derive(Debug, Deserialize)]
struct ApplicationManifest {
    #[serde(rename = "ServiceManifestImport", default)]
    imports: Vec<ServiceManifestImport>,
}

#[derive(Debug, Deserialize)]
struct ServiceManifestImport {
    #[serde(rename = "ServiceManifestRef")]
    manifest_ref: ServiceManifestRef,
    #[serde(rename = "Policies", default)]
    policies: Option<Policies>,
}

#[derive(Debug, Deserialize)]
struct ServiceManifestRef {
    #[serde(rename = "@ServiceManifestName")]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Policies {
    #[serde(rename = "ResourceGovernancePolicy", default)]
    code_packages: Vec<CodePackagePolicy>,
    #[serde(rename = "ServicePackageResourceGovernancePolicy", default)]
    service_package: Option<ServicePackagePolicy>,
}

#[derive(Debug, Deserialize)]
struct CodePackagePolicy {
    #[serde(rename = "@CodePackageRef")]
    code_package_ref: String,
    #[serde(rename = "@CpuShares", default)]
    cpu_shares: Option<String>,
    #[serde(rename = "@MemoryInMB", default)]
    memory_in_mb: Option<String>,
    #[serde(rename = "@MemoryInMBLimit", default)]
    memory_in_mb_limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServicePackagePolicy {
    #[serde(rename = "@CpuCores", default)]
    cpu_cores: Option<String>,
    #[serde(rename = "@CpuCoresLimit", default)]
    cpu_cores_limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceManifest {
    #[serde(rename = "CodePackage", default)]
    code_packages: Vec<IgnoredAny>,
}

/// Whether an application manifest declares any governance policy node
pub fn has_governance_policy(application_manifest: &str) -> bool {
    application_manifest.contains(CODE_PACKAGE_POLICY)
        || application_manifest.contains(SERVICE_PACKAGE_POLICY)
}

/// Replace a `[Name]` reference with the parameter value, if one is set
pub fn parse_app_parameter_value(value: &str, parameters: &BTreeMap<String, String>) -> String {
    let trimmed = value.trim();
    if let Some(name) = trimmed.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        if let Some(resolved) = parameters.get(name) {
            return resolved.clone();
        }
        return name.to_string();
    }
    trimmed.to_string()
}

fn positive(value: Option<&str>, parameters: &BTreeMap<String, String>) -> Option<f64> {
    let value = parse_app_parameter_value(value?, parameters);
    value.parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// Core limit of one code package from the service package's total.
///
/// Shares of zero count as one. Code packages without a policy each add one
/// implicit share to the denominator.
pub fn cpu_share_limit(
    total_cores: f64,
    own_shares: Option<f64>,
    declared_shares: &[f64],
    code_package_count: usize,
) -> Option<f64> {
    if total_cores <= 0.0 {
        return None;
    }
    let normalize = |s: f64| if s <= 0.0 { 1.0 } else { s };
    let implicit = code_package_count.saturating_sub(declared_shares.len()) as f64;
    let sum: f64 = declared_shares.iter().copied().map(normalize).sum::<f64>() + implicit;
    if sum <= 0.0 {
        return None;
    }
    Some(total_cores * normalize(own_shares.unwrap_or(1.0)) / sum)
}

fn parse_application_manifest(xml: &str) -> Result<ApplicationManifest> {
    quick_xml::de::from_str(xml).map_err(|e| ObserverError::parse("application manifest", e.to_string()))
}

fn policies_for<'a>(manifest: &'a ApplicationManifest, service_manifest_name: &str) -> Option<&'a Policies> {
    manifest
        .imports
        .iter()
        .find(|i| i.manifest_ref.name == service_manifest_name)
        .and_then(|i| i.policies.as_ref())
}

/// Memory limit in MB for a code package. Prefers `MemoryInMBLimit`.
pub fn memory_limit_mb(
    application_manifest: &str,
    service_manifest_name: &str,
    code_package_name: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<Option<f64>> {
    if !application_manifest.contains(CODE_PACKAGE_POLICY) {
        return Ok(None);
    }
    let manifest = parse_application_manifest(application_manifest)?;
    let Some(policies) = policies_for(&manifest, service_manifest_name) else {
        return Ok(None);
    };

    Ok(policies
        .code_packages
        .iter()
        .find(|p| p.code_package_ref == code_package_name)
        .and_then(|p| {
            positive(p.memory_in_mb_limit.as_deref(), parameters)
                .or_else(|| positive(p.memory_in_mb.as_deref(), parameters))
        }))
}

/// CPU core limit for a code package from the service package core limit
pub fn cpu_limit_cores(
    application_manifest: &str,
    service_manifest: &str,
    service_manifest_name: &str,
    code_package_name: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<Option<f64>> {
    if !has_governance_policy(application_manifest) {
        return Ok(None);
    }
    let manifest = parse_application_manifest(application_manifest)?;
    let Some(policies) = policies_for(&manifest, service_manifest_name) else {
        return Ok(None);
    };
    let Some(package_policy) = &policies.service_package else {
        return Ok(None);
    };
    let Some(total_cores) = positive(package_policy.cpu_cores_limit.as_deref(), parameters)
        .or_else(|| positive(package_policy.cpu_cores.as_deref(), parameters))
    else {
        return Ok(None);
    };

    let mut declared = Vec::with_capacity(policies.code_packages.len());
    let mut own = None;
    for policy in &policies.code_packages {
        let shares = match policy.cpu_shares.as_deref() {
            None => 1.0,
            Some(raw) if raw.trim().is_empty() => 1.0,
            Some(raw) => match parse_app_parameter_value(raw, parameters).parse::<f64>() {
                Ok(v) => v,
                // an unusable share makes the split unknowable
                Err(_) => return Ok(None),
            },
        };
        if policy.code_package_ref == code_package_name {
            own = Some(shares);
        }
        declared.push(shares);
    }

    let service: ServiceManifest = quick_xml::de::from_str(service_manifest)
        .map_err(|e| ObserverError::parse("service manifest", e.to_string()))?;

    Ok(cpu_share_limit(total_cores, own, &declared, service.code_packages.len()))
}

/// Both limits for a code package, `None` when neither is declared
pub fn resource_governance_limits(
    application_manifest: &str,
    service_manifest: Option<&str>,
    service_manifest_name: &str,
    code_package_name: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<Option<ResourceGovernanceLimits>> {
    let limits = ResourceGovernanceLimits {
        memory_limit_mb: memory_limit_mb(
            application_manifest,
            service_manifest_name,
            code_package_name,
            parameters,
        )?,
        cpu_limit_cores: match service_manifest {
            Some(service_manifest) => cpu_limit_cores(
                application_manifest,
                service_manifest,
                service_manifest_name,
                code_package_name,
                parameters,
            )?,
            None => None,
        },
    };
    Ok((!limits.is_empty()).then_some(limits))
}
