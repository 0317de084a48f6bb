//! Activity port: the service call a processor ultimately performs.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::context::InvocationContext;
use crate::domain::ActivityError;

/// Resolved input values keyed by input port name.
pub type ActivityInputs = BTreeMap<String, serde_json::Value>;

/// Output values keyed by output port name.
pub type ActivityOutputs = BTreeMap<String, serde_json::Value>;

/// One backing implementation of a processor.
///
/// `invoke` is called on a worker from the shared executor and may await
/// freely. A failure is returned as a value; it is never a panic.
///
/// ```ignore
/// struct Upper;
///
/// #[async_trait]
/// impl Activity for Upper {
///     fn name(&self) -> &str { "upper" }
///
///     async fn invoke(&self, inputs: ActivityInputs, _ctx: &InvocationContext)
///         -> Result<ActivityOutputs, ActivityError>
///     {
///         let s = inputs["in"].as_str().unwrap_or_default().to_uppercase();
///         Ok(BTreeMap::from([("out".to_string(), s.into())]))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        inputs: ActivityInputs,
        context: &InvocationContext,
    ) -> Result<ActivityOutputs, ActivityError>;
}

/// Activity backed by a synchronous closure. Handy for pure computations.
pub struct FnActivity<F> {
    name: String,
    f: F,
}

impl<F> FnActivity<F>
where
    F: Fn(ActivityInputs) -> Result<ActivityOutputs, ActivityError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnActivity<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnActivity").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Activity for FnActivity<F>
where
    F: Fn(ActivityInputs) -> Result<ActivityOutputs, ActivityError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        inputs: ActivityInputs,
        _context: &InvocationContext,
    ) -> Result<ActivityOutputs, ActivityError> {
        (self.f)(inputs)
    }
}
