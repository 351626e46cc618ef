//! Provisioner trait.
//!
//! Provisioners create and delete resources in an external system (cloud
//! APIs, terragrunt units, DNS providers). The orchestrator only ever talks to
//! them through this trait.

use async_trait::async_trait;

use crate::Result;
use crate::value::ValueMap;

/// Trait for resource provisioners.
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Name of this provisioner.
    fn name(&self) -> &'static str;

    /// Whether an in-flight `provision` future may be dropped to abort the
    /// external call.
    fn supports_cancellation(&self) -> bool {
        false
    }

    /// Create (or converge) a resource and return its outputs.
    ///
    /// Expected to be idempotent per resource: calling it for a resource that
    /// already exists must not create a second one.
    async fn provision(&self, resource_type: &str, inputs: &ValueMap) -> Result<ValueMap>;

    /// Delete a resource previously created with the given outputs.
    async fn destroy(&self, resource_type: &str, state: &ValueMap) -> Result<()>;
}
