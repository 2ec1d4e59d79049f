use futures::future::{join_all, try_join_all};

use super::{NodeKey, NodeOutput};
use crate::context::Context;
use crate::core::TypeId;
use crate::error::Failure;
use crate::host::{Continuation, Get, Resume, Value};
use crate::interning::Retained;
use crate::tasks::TaskId;

async fn select_value(context: &Context, subject: Retained, product: TypeId) -> Result<Value, Failure> {
    let output = context.get(NodeKey::select(subject, product)).await?;
    context.resolve(&output.into_value()?)
}

async fn get(context: &Context, get: Get<Value>) -> Result<Value, Failure> {
    let subject = context.retain(&get.subject);
    select_value(context, subject, get.product).await
}

/// Only a `Throw` is handed back to the body; every other failure ends the
/// task with it.
fn resume_with(result: Result<Value, Failure>) -> Result<Resume<Value>, Failure> {
    match result {
        Ok(value) => Ok(Resume::Value(value)),
        Err(Failure::Throw { exc, .. }) => Ok(Resume::Throw(exc)),
        Err(failure) => Err(failure),
    }
}

fn resume_with_all(results: Vec<Result<Value, Failure>>) -> Result<Resume<Value>, Failure> {
    let mut values = Vec::with_capacity(results.len());
    let mut thrown = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(Failure::Throw { exc, .. }) => {
                thrown.get_or_insert(exc);
            }
            Err(failure) => return Err(failure),
        }
    }
    Ok(match thrown {
        Some(exc) => Resume::Throw(exc),
        None => Resume::Values(values),
    })
}

/// Drives a rule body: calls the task function with its selected
/// arguments, then resumes the returned generator with the result of each
/// dependency request until it finishes.
pub(super) async fn run(context: Context, subject: Retained, task_id: TaskId) -> Result<NodeOutput, Failure> {
    let core = context.core.clone();
    let task = &core.tasks[task_id];
    let externs = &core.externs;

    let args = try_join_all(
        task.clause
            .iter()
            .map(|product| select_value(&context, subject.clone(), *product)),
    )
    .await?;

    let func = core
        .interns
        .resolve(&task.func.key)
        .map_err(|err| Failure::Broke(err.to_string()))?;
    let called = {
        let _worker = context.session.worker().await;
        externs.call(&func, &args)
    };
    let generator = called.map_err(|exc| Failure::Throw {
        message: externs.val_to_str(&exc),
        exc,
    })?;

    let mut input = Resume::Start;
    loop {
        if context.session.is_cancelled() {
            return Err(Failure::Cancelled);
        }

        // The slot is given back before any dependency is awaited.
        let step = {
            let _worker = context.session.worker().await;
            externs.generator_send(&generator, input)
        };
        match step {
            Continuation::Get(request) => {
                input = resume_with(get(&context, request).await)?;
            }
            Continuation::GetMulti(requests) => {
                let results = join_all(requests.into_iter().map(|request| get(&context, request))).await;
                input = resume_with_all(results)?;
            }
            Continuation::Done(value) => {
                let retained = context.retain(&value);
                if retained.type_id() != task.product {
                    return Err(Failure::Broke(format!(
                        "{task} returned a {} where a {} was declared",
                        core.type_name(retained.type_id()),
                        core.type_name(task.product),
                    )));
                }
                return Ok(NodeOutput::Value(retained));
            }
            Continuation::Throw(exc) => {
                let message = externs.val_to_str(&exc);
                tracing::debug!(task = %task, %message, "Rule raised");
                return Err(Failure::Throw { exc, message });
            }
            Continuation::Broke(message) => return Err(Failure::Broke(message)),
        }
    }
}
