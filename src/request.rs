use crate::core::TypeId;
use crate::error::SchedulerError;
use crate::host::Value;
use crate::interning::Retained;
use crate::scheduler::Scheduler;

#[derive(Clone, Debug)]
pub(crate) struct Root {
    pub subject: Retained,
    pub product: TypeId,
}

/// The roots of one [`Scheduler::execute`] call, in the order their results
/// are returned.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRequest {
    roots: Vec<Root>,
}

impl ExecutionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root. Fails when no installed rule produces `product` for the
    /// subject's type.
    pub fn add_root(
        &mut self,
        scheduler: &Scheduler,
        subject: &Value,
        product: TypeId,
    ) -> Result<(), SchedulerError> {
        let subject = scheduler.intern(subject);
        if scheduler.rule_graph().rule_for(subject.type_id(), product).is_none() {
            return Err(SchedulerError::NoRule {
                subject: scheduler.externs().type_to_str(subject.type_id()),
                product: scheduler.externs().type_to_str(product),
            });
        }
        self.roots.push(Root { subject, product });
        Ok(())
    }

    pub(crate) fn roots(&self) -> &[Root] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
