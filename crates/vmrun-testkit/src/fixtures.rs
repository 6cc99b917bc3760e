use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;
use vmrun_schemas::{HardwareProfile, Instance, ProviderRef};

/// Fixed base instant plus `hours`.
pub fn ts(hours: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_717_200_000, 0)
        .single()
        .map(|base| base + Duration::hours(hours))
        .unwrap_or_default()
}

pub fn aws_instance(account_ref: &str) -> Instance {
    let instance_id = Uuid::new_v4();
    Instance {
        instance_id,
        account_ref: account_ref.to_string(),
        provider: ProviderRef::Aws {
            instance_id: format!("i-{}", &instance_id.simple().to_string()[..17]),
            region: "us-east-1".to_string(),
        },
        created_at: ts(0),
    }
}

/// A few common EC2 types.
pub fn standard_catalog() -> Vec<HardwareProfile> {
    [("t3.micro", 1.0, 2), ("m5.large", 8.0, 2), ("m5.xlarge", 16.0, 4)]
        .into_iter()
        .map(|(id, mem, vcpu)| HardwareProfile {
            profile_id: id.to_string(),
            memory_gib: mem,
            vcpu,
            provider: Some("aws".to_string()),
        })
        .collect()
}
