//! Interface to the image security gate (signature verification,
//! vulnerability scanning, SBOM generation) and the policy applied to its
//! answers before any destructive step.

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use serde::{Deserialize, Serialize};

use crate::events::{self, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Verified,
    Unverified,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureReport {
    pub status: SignatureStatus,
    #[serde(default)]
    pub signatures: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Ok,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub status: ScanStatus,
    #[serde(default)]
    pub summary: SeveritySummary,
    pub blocking_count: Option<u32>,
    #[serde(default)]
    pub block_severities: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbomStatus {
    Generated,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomReport {
    pub status: SbomStatus,
    #[serde(default)]
    pub formats: Vec<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait SecurityGate: Send + Sync {
    async fn verify_signature(
        &self,
        image: &str,
        auth: Option<&DockerCredentials>,
    ) -> SignatureReport;

    async fn scan(&self, image: &str, auth: Option<&DockerCredentials>) -> ScanReport;

    async fn generate_sbom(
        &self,
        image: &str,
        auth: Option<&DockerCredentials>,
        formats: &[String],
    ) -> SbomReport;
}

/// Gate used when no scanner is configured: everything passes.
pub struct DisabledSecurityGate;

#[async_trait]
impl SecurityGate for DisabledSecurityGate {
    async fn verify_signature(&self, _: &str, _: Option<&DockerCredentials>) -> SignatureReport {
        SignatureReport {
            status: SignatureStatus::Skipped,
            signatures: vec![],
            error: None,
        }
    }

    async fn scan(&self, _: &str, _: Option<&DockerCredentials>) -> ScanReport {
        ScanReport {
            status: ScanStatus::Ok,
            summary: SeveritySummary::default(),
            blocking_count: None,
            block_severities: vec![],
            error: None,
        }
    }

    async fn generate_sbom(
        &self,
        _: &str,
        _: Option<&DockerCredentials>,
        _: &[String],
    ) -> SbomReport {
        SbomReport {
            status: SbomStatus::Skipped,
            formats: vec![],
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SecurityPolicy {
    /// Refuse images whose signature cannot be verified.
    #[serde(default)]
    pub verify_signatures: bool,
    /// SBOM formats to request; empty disables SBOM generation.
    #[serde(default)]
    pub sbom_formats: Vec<String>,
}

/// Why the gate refused an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRefusal(pub String);

/// Run the gate for `image`. Raises a security alert for any critical or
/// high finding, blocked or not.
pub async fn evaluate(
    gate: &dyn SecurityGate,
    policy: &SecurityPolicy,
    sink: &dyn EventSink,
    container_name: &str,
    image: &str,
    auth: Option<&DockerCredentials>,
) -> Result<(), GateRefusal> {
    if policy.verify_signatures {
        let report = gate.verify_signature(image, auth).await;
        match report.status {
            SignatureStatus::Verified => {
                log::info!(
                    "Signature of {image} verified ({} signatures)",
                    report.signatures.len()
                );
            }
            SignatureStatus::Skipped => log::debug!("Signature verification skipped for {image}"),
            SignatureStatus::Unverified | SignatureStatus::Error => {
                return Err(GateRefusal(format!(
                    "signature verification failed for {image}: {}",
                    report.error.as_deref().unwrap_or("no valid signature")
                )));
            }
        }
    }

    let report = gate.scan(image, auth).await;
    let summary = report.summary;
    let blocked = report.status == ScanStatus::Blocked;
    if summary.critical > 0 || summary.high > 0 {
        sink.emit(events::security_alert(
            container_name,
            image,
            summary.critical,
            summary.high,
            blocked,
        ))
        .await;
    }
    match report.status {
        ScanStatus::Ok => {}
        ScanStatus::Blocked => {
            return Err(GateRefusal(format!(
                "vulnerability scan blocked {image}: {} blocking findings ({})",
                report.blocking_count.unwrap_or(summary.critical + summary.high),
                report.block_severities.join(", ")
            )));
        }
        ScanStatus::Error => {
            return Err(GateRefusal(format!(
                "vulnerability scan of {image} failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            )));
        }
    }

    if !policy.sbom_formats.is_empty() {
        let sbom = gate.generate_sbom(image, auth, &policy.sbom_formats).await;
        if sbom.status == SbomStatus::Error {
            log::warn!(
                "SBOM generation for {image} failed: {}",
                sbom.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}
