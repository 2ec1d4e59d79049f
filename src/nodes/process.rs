use std::time::Duration;

use camino::Utf8PathBuf;

use super::NodeOutput;
use super::fs::{digest_value, parse_digest};
use crate::context::Context;
use crate::error::Failure;
use crate::host::Value;
use crate::process::{Process, ProcessResult, RunContext};

/// Reads a host `Process` value.
///
/// `env` is a flat sequence of alternating keys and values. A
/// `timeout_seconds` of zero or less means no timeout, and an empty
/// `working_directory` means the sandbox root.
pub(super) fn parse_process(context: &Context, value: &Value) -> Result<Process, Failure> {
    let externs = &context.core.externs;

    let argv = externs.project_multi_strs(value, "argv");
    if argv.is_empty() {
        return Err(context.throw("Process argv must not be empty"));
    }

    let flat_env = externs.project_multi_strs(value, "env");
    if flat_env.len() % 2 != 0 {
        return Err(context.throw("Process env must hold key/value pairs"));
    }
    let env = flat_env
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();

    let input = externs.project(value, "input_digest");
    let input_digest = parse_digest(context, &input)?;

    let working_directory = externs.project_str(value, "working_directory");
    let timeout = externs.project_i64(value, "timeout_seconds");

    let process = Process {
        argv,
        env,
        input_digest,
        working_directory: (!working_directory.is_empty()).then(|| Utf8PathBuf::from(working_directory)),
        output_files: externs
            .project_multi_strs(value, "output_files")
            .into_iter()
            .map(Utf8PathBuf::from)
            .collect(),
        output_directories: externs
            .project_multi_strs(value, "output_directories")
            .into_iter()
            .map(Utf8PathBuf::from)
            .collect(),
        timeout: (timeout > 0).then(|| Duration::from_secs(timeout as u64)),
        description: externs.project_str(value, "description"),
    };
    process.validate().map_err(|err| context.throw(err.to_string()))?;
    Ok(process)
}

pub(super) async fn execute(context: &Context, process: &Process) -> Result<NodeOutput, Failure> {
    let run = RunContext {
        metrics: context.session.counters().clone(),
    };
    let outcome = {
        let _worker = context.session.worker().await;
        context.core.runner.run(&run, process.clone()).await
    };
    match outcome {
        Ok(result) => Ok(NodeOutput::ProcessResult(result.into())),
        // Infrastructure trouble surfaces to the rule body as an exception.
        Err(err) => {
            tracing::warn!(process = %process, "{err}");
            Err(context.throw(err.to_string()))
        }
    }
}

pub(super) fn result_value(context: &Context, result: &ProcessResult) -> Result<Value, Failure> {
    let Some(types) = context.core.families.process.as_ref() else {
        return Err(Failure::Broke("Process types are not configured".to_string()));
    };
    let externs = &context.core.externs;
    let store = &context.core.store;
    let load = |digest| {
        store
            .load_bytes(digest)
            .map_err(|err| context.throw(err.to_string()))
    };

    let args = [
        externs.store_bytes(&load(result.stdout)?),
        externs.store_bytes(&load(result.stderr)?),
        externs.store_i64(result.exit_code.into()),
        digest_value(context, result.output_digest)?,
    ];
    context.construct(&types.construct_process_result, &args)
}
