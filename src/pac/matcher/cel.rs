//! CEL evaluation for `on-cel-expression` filters. The environment is fixed:
//! `event`, `event_type`, `target_branch`, `source_branch`, `headers`,
//! `body`, `files` and the `pathChanged` string method. No stateful
//! builtins.

use std::collections::BTreeMap;
use std::sync::Arc;

use cel_interpreter::extractors::This;
use cel_interpreter::{Context, Program, Value};
use globset::Glob;

use crate::pac::event::Event;
use crate::provider::ChangedFiles;

pub fn compile(expression: &str) -> Result<Program, String> {
    Program::compile(expression).map_err(|error| error.to_string())
}

/// Does the compiled expression need the changed-file list? Used to defer
/// the provider call until an expression actually requires it.
pub fn needs_changed_files(program: &Program) -> bool {
    let references = program.references();
    references.has_function("pathChanged") || references.has_variable("files")
}

pub fn evaluate(
    program: &Program,
    event: &Event,
    event_type: &str,
    files: Option<Arc<ChangedFiles>>,
) -> Result<bool, String> {
    let mut context = Context::default();

    context
        .add_variable("event", event_type)
        .map_err(|e| e.to_string())?;
    context
        .add_variable("event_type", event_type)
        .map_err(|e| e.to_string())?;
    context
        .add_variable("target_branch", event.base_branch.clone())
        .map_err(|e| e.to_string())?;
    context
        .add_variable("source_branch", event.head_branch.clone())
        .map_err(|e| e.to_string())?;
    context
        .add_variable("headers", event.headers.clone())
        .map_err(|e| e.to_string())?;
    context
        .add_variable("body", event.raw_payload.clone())
        .map_err(|e| e.to_string())?;

    let files = files.unwrap_or_default();
    let files_map: BTreeMap<&str, Vec<String>> = BTreeMap::from([
        ("all", files.all.clone()),
        ("added", files.added.clone()),
        ("modified", files.modified.clone()),
        ("deleted", files.deleted.clone()),
        ("renamed", files.renamed.clone()),
    ]);
    context
        .add_variable("files", files_map)
        .map_err(|e| e.to_string())?;

    let changed = files.all.clone();
    context.add_function("pathChanged", move |This(glob): This<Arc<String>>| -> bool {
        path_changed(&glob, &changed)
    });

    match program.execute(&context) {
        Ok(Value::Bool(value)) => Ok(value),
        Ok(other) => Err(format!("expression returned {other:?}, expected a boolean")),
        Err(error) => Err(error.to_string()),
    }
}

pub(crate) fn path_changed(pattern: &str, files: &[String]) -> bool {
    let Ok(glob) = Glob::new(pattern) else {
        return false;
    };
    let matcher = glob.compile_matcher();
    files.iter().any(|file| matcher.is_match(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::event_builder::TestEvent;

    fn eval(expression: &str, event: &Event, files: Option<ChangedFiles>) -> bool {
        let program = compile(expression).unwrap();
        evaluate(
            &program,
            event,
            crate::pac::matcher::match_event_type(event),
            files.map(Arc::new),
        )
        .unwrap()
    }

    #[test]
    fn matches_event_and_branch() {
        let event = TestEvent::default().build();
        assert!(eval(
            r#"event == "pull_request" && target_branch == "main""#,
            &event,
            None
        ));
        assert!(!eval(r#"event == "push""#, &event, None));
    }

    #[test]
    fn path_changed_globs() {
        let event = TestEvent::default().build();
        let files = ChangedFiles {
            all: vec!["docs/x.md".to_string()],
            ..Default::default()
        };
        assert!(eval(r#""**/*.md".pathChanged()"#, &event, Some(files.clone())));
        assert!(!eval(r#""**/*.go".pathChanged()"#, &event, Some(files)));
    }

    #[test]
    fn detects_files_usage() {
        let program = compile(r#""**/*.go".pathChanged()"#).unwrap();
        assert!(needs_changed_files(&program));
        let program = compile(r#"files.all.size() > 0"#).unwrap();
        assert!(needs_changed_files(&program));
        let program = compile(r#"event == "push""#).unwrap();
        assert!(!needs_changed_files(&program));
    }

    #[test]
    fn source_branch_binding() {
        let event = TestEvent::default().head_branch("feature").build();
        assert!(eval(r#"source_branch == "feature""#, &event, None));
    }

    #[test]
    fn non_boolean_result_is_an_error() {
        let program = compile(r#"target_branch"#).unwrap();
        let event = TestEvent::default().build();
        assert!(
            evaluate(
                &program,
                &event,
                crate::pac::matcher::match_event_type(&event),
                None
            )
            .is_err()
        );
    }
}
