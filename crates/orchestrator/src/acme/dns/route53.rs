//! Route 53 challenge records

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_route53::error::{DisplayErrorContext, SdkError};
use aws_sdk_route53::operation::change_resource_record_sets::ChangeResourceRecordSetsError;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use aws_sdk_route53::Client;
use tracing::debug;

use super::DnsProvider;
use crate::acme::error::DnsError;

/// Bound on a single Route 53 API call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes TXT records into one hosted zone
#[derive(Debug, Clone)]
pub struct Route53DnsProvider {
    client: Client,
    hosted_zone_id: String,
}

impl Route53DnsProvider {
    pub fn new(sdk_config: &aws_config::SdkConfig, hosted_zone_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(sdk_config),
            hosted_zone_id: hosted_zone_id.into(),
        }
    }

    async fn change(
        &self,
        action: ChangeAction,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> Result<(), SdkOrBuild> {
        let record = ResourceRecord::builder()
            .value(quote_txt(value))
            .build()
            .map_err(|e| SdkOrBuild::Build(e.to_string()))?;
        let record_set = ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::Txt)
            .ttl(i64::from(ttl))
            .resource_records(record)
            .build()
            .map_err(|e| SdkOrBuild::Build(e.to_string()))?;
        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| SdkOrBuild::Build(e.to_string()))?;
        let batch = ChangeBatch::builder()
            .comment("radcert DNS-01 challenge")
            .changes(change)
            .build()
            .map_err(|e| SdkOrBuild::Build(e.to_string()))?;

        let call = self
            .client
            .change_resource_record_sets()
            .hosted_zone_id(&self.hosted_zone_id)
            .change_batch(batch)
            .send();

        match tokio::time::timeout(REQUEST_TIMEOUT, call).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SdkOrBuild::Sdk(e)),
            Err(_) => Err(SdkOrBuild::Timeout),
        }
    }
}

enum SdkOrBuild {
    Sdk(SdkError<ChangeResourceRecordSetsError>),
    Build(String),
    Timeout,
}

/// TXT values travel quoted in the Route 53 API
fn quote_txt(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

fn dns_error(err: SdkOrBuild) -> DnsError {
    let err = match err {
        SdkOrBuild::Build(message) => return DnsError::Rejected(message),
        SdkOrBuild::Timeout => return DnsError::Transport("Route 53 request timed out".to_string()),
        SdkOrBuild::Sdk(err) => err,
    };

    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = DisplayErrorContext(&err).to_string();
    match err.as_service_error() {
        Some(ChangeResourceRecordSetsError::PriorRequestNotComplete(_)) => {
            DnsError::Throttled(message)
        }
        Some(ChangeResourceRecordSetsError::NoSuchHostedZone(_)) => DnsError::Denied(message),
        Some(ChangeResourceRecordSetsError::InvalidChangeBatch(_))
        | Some(ChangeResourceRecordSetsError::InvalidInput(_)) => DnsError::Rejected(message),
        _ => match status {
            Some(401) | Some(403) => DnsError::Denied(message),
            Some(400) if message.contains("Throttling") => DnsError::Throttled(message),
            Some(s) if s >= 500 => DnsError::Transport(message),
            Some(_) => DnsError::Rejected(message),
            None => DnsError::Transport(message),
        },
    }
}

fn is_missing_record(err: &SdkOrBuild) -> bool {
    match err {
        SdkOrBuild::Sdk(err) => matches!(
            err.as_service_error(),
            Some(ChangeResourceRecordSetsError::InvalidChangeBatch(e))
                if e.to_string().contains("not found")
        ),
        _ => false,
    }
}

#[async_trait]
impl DnsProvider for Route53DnsProvider {
    async fn upsert_txt(&self, name: &str, value: &str, ttl: u32) -> Result<(), DnsError> {
        self.change(ChangeAction::Upsert, name, value, ttl)
            .await
            .map_err(dns_error)?;
        debug!(zone = %self.hosted_zone_id, name = %name, "Upserted TXT record");
        Ok(())
    }

    async fn delete_txt(&self, name: &str, value: &str, ttl: u32) -> Result<(), DnsError> {
        match self.change(ChangeAction::Delete, name, value, ttl).await {
            Ok(()) => {
                debug!(zone = %self.hosted_zone_id, name = %name, "Deleted TXT record");
                Ok(())
            }
            Err(e) if is_missing_record(&e) => {
                debug!(name = %name, "TXT record already absent");
                Ok(())
            }
            Err(e) => Err(dns_error(e)),
        }
    }
}
