//! Account and region scoping, ARN helpers

use std::fmt;

pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Key for account and region scoped state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountRegionKey {
    pub account_id: String,
    pub region: String,
}

impl AccountRegionKey {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
        }
    }

    /// Build an ARN for a resource owned by this account/region
    pub fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.account_id, resource
        )
    }
}

impl Default for AccountRegionKey {
    fn default() -> Self {
        Self::new(DEFAULT_ACCOUNT_ID, DEFAULT_REGION)
    }
}

impl fmt::Display for AccountRegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.region)
    }
}

/// Parsed `arn:partition:service:region:account:resource`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub scope: AccountRegionKey,
    pub resource: String,
}

impl Arn {
    pub fn parse(arn: &str) -> Option<Self> {
        let mut parts = arn.splitn(6, ':');
        if parts.next()? != "arn" {
            return None;
        }
        let partition = parts.next()?;
        let service = parts.next()?;
        let region = parts.next()?;
        let account_id = parts.next()?;
        let resource = parts.next()?;

        if partition.is_empty() || service.is_empty() || resource.is_empty() {
            return None;
        }

        Some(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            scope: AccountRegionKey::new(account_id, region),
            resource: resource.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_arn() {
        let key = AccountRegionKey::new("123456789012", "eu-west-1");
        assert_eq!(
            key.arn("sqs", "orders"),
            "arn:aws:sqs:eu-west-1:123456789012:orders"
        );
    }

    #[test]
    fn test_parse_arn() {
        let arn = Arn::parse("arn:aws:sqs:us-west-2:123456789012:jobs.fifo").unwrap();
        assert_eq!(arn.service, "sqs");
        assert_eq!(arn.scope.region, "us-west-2");
        assert_eq!(arn.scope.account_id, "123456789012");
        assert_eq!(arn.resource, "jobs.fifo");
    }

    #[test]
    fn test_parse_invalid_arn() {
        assert!(Arn::parse("not-an-arn").is_none());
        assert!(Arn::parse("arn:aws:sqs:us-east-1").is_none());
        assert!(Arn::parse("arn:aws:sqs:us-east-1:000000000000:").is_none());
    }
}
