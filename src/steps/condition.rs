//! condition step: branch on an expression over the context.

use tracing::debug;

use super::StepRegistry;
use crate::error::Result;
use crate::workflow::expression::evaluate_condition;
use crate::workflow::{merge_context, ConditionSpec, Context};

/// Evaluate the condition and run the chosen branch.
///
/// Branch steps run in order; each sees the context plus the outputs of
/// the branch steps before it, and those outputs shadow incoming keys of the
/// same name. The merged branch outputs are returned. An empty branch
/// returns an empty update.
pub async fn execute(
    spec: &ConditionSpec,
    context: &Context,
    registry: &StepRegistry,
) -> Result<Context> {
    let taken = evaluate_condition(&spec.condition, context)?;
    let branch = if taken {
        &spec.then_steps
    } else {
        &spec.else_steps
    };
    debug!(
        condition = %spec.condition,
        taken,
        steps = branch.len(),
        "Condition evaluated"
    );

    let mut scope = context.clone();
    let mut output = Context::new();
    for raw in branch {
        let update = registry.execute(raw, &scope).await?;
        merge_context(&mut scope, update.clone());
        merge_context(&mut output, update);
    }
    Ok(output)
}
